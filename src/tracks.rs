//! Multi-view correspondence tracks and the provider seams the engine
//! consumes its inputs through.
//!
//! Pairwise feature matches are fused into tracks by union-find: two
//! features matched across a pair belong to the same track, and tracks
//! chain transitively across pairs. Tracks that end up observing the
//! same view twice are contradictory and dropped, as are tracks shorter
//! than two views.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::Vector2;

use crate::scene::{TrackId, ViewId};

/// Canonical unordered view pair, smaller id first.
pub type Pair = (ViewId, ViewId);

/// One feature correspondence inside a pair: (index in first view,
/// index in second view), first meaning the smaller view id.
pub type IndexMatch = (usize, usize);

pub fn make_pair(a: ViewId, b: ViewId) -> Pair {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Per-view 2D feature positions. Descriptor payloads never reach the
/// reconstruction core.
pub trait FeaturesProvider: Send + Sync {
    fn features(&self, view: ViewId) -> &[Vector2<f64>];
}

/// Pairwise correspondences between views.
pub trait MatchesProvider: Send + Sync {
    /// Every pair that has at least one correspondence.
    fn pairs(&self) -> Vec<Pair>;
    fn matches_for(&self, pair: Pair) -> Option<&[IndexMatch]>;
}

/// In-memory feature store.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    features: HashMap<ViewId, Vec<Vector2<f64>>>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, view: ViewId, features: Vec<Vector2<f64>>) {
        self.features.insert(view, features);
    }
}

impl FeaturesProvider for FeatureTable {
    fn features(&self, view: ViewId) -> &[Vector2<f64>] {
        self.features.get(&view).map_or(&[], |f| f.as_slice())
    }
}

/// In-memory pairwise match store with canonical pair keys.
#[derive(Debug, Clone, Default)]
pub struct PairwiseMatches {
    matches: BTreeMap<Pair, Vec<IndexMatch>>,
}

impl PairwiseMatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert matches for a pair given in any order; indices are flipped
    /// when the pair needs reordering.
    pub fn insert(&mut self, a: ViewId, b: ViewId, matches: Vec<IndexMatch>) {
        if a <= b {
            self.matches.insert((a, b), matches);
        } else {
            self.matches
                .insert((b, a), matches.into_iter().map(|(i, j)| (j, i)).collect());
        }
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

impl MatchesProvider for PairwiseMatches {
    fn pairs(&self) -> Vec<Pair> {
        self.matches.keys().copied().collect()
    }

    fn matches_for(&self, pair: Pair) -> Option<&[IndexMatch]> {
        self.matches.get(&pair).map(|m| m.as_slice())
    }
}

/// A multi-view correspondence: which feature of each view belongs to
/// the same candidate 3D point. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub observations: BTreeMap<ViewId, usize>,
}

impl Track {
    pub fn feature_in(&self, view: ViewId) -> Option<usize> {
        self.observations.get(&view).copied()
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.observations.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// All tracks keyed by id.
pub type Tracks = BTreeMap<TrackId, Track>;

/// Union-find with path halving and union by size.
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

/// Fuse pairwise matches into tracks.
///
/// Returns tracks with stable, deterministic ids: features are numbered
/// in sorted (view, feature) order, so identical inputs always yield
/// identical track tables.
pub fn build_tracks(matches: &dyn MatchesProvider) -> Tracks {
    // Collect the feature nodes touched by any match, in sorted order.
    let mut nodes: BTreeSet<(ViewId, usize)> = BTreeSet::new();
    for pair in matches.pairs() {
        if let Some(pair_matches) = matches.matches_for(pair) {
            for &(i, j) in pair_matches {
                nodes.insert((pair.0, i));
                nodes.insert((pair.1, j));
            }
        }
    }

    let node_index: HashMap<(ViewId, usize), usize> =
        nodes.iter().enumerate().map(|(idx, &n)| (n, idx)).collect();
    let node_list: Vec<(ViewId, usize)> = nodes.into_iter().collect();

    let mut uf = UnionFind::new(node_list.len());
    for pair in matches.pairs() {
        if let Some(pair_matches) = matches.matches_for(pair) {
            for &(i, j) in pair_matches {
                uf.union(node_index[&(pair.0, i)], node_index[&(pair.1, j)]);
            }
        }
    }

    // Group by root; a root maps to None once a view conflict is found.
    let mut groups: BTreeMap<usize, Option<BTreeMap<ViewId, usize>>> = BTreeMap::new();
    for (idx, &(view, feature)) in node_list.iter().enumerate() {
        let root = uf.find(idx);
        let entry = groups.entry(root).or_insert_with(|| Some(BTreeMap::new()));
        if let Some(obs) = entry {
            match obs.get(&view) {
                Some(&existing) if existing != feature => *entry = None,
                _ => {
                    obs.insert(view, feature);
                }
            }
        }
    }

    let mut tracks = Tracks::new();
    let mut next_id = 0u32;
    for (_, group) in groups {
        if let Some(observations) = group {
            if observations.len() >= 2 {
                tracks.insert(TrackId(next_id), Track { observations });
                next_id += 1;
            }
        }
    }
    tracks
}

/// Inverted index: which tracks observe each view.
pub fn tracks_per_view(tracks: &Tracks) -> HashMap<ViewId, BTreeSet<TrackId>> {
    let mut index: HashMap<ViewId, BTreeSet<TrackId>> = HashMap::new();
    for (&id, track) in tracks {
        for view in track.views() {
            index.entry(view).or_default().insert(id);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: u32) -> ViewId {
        ViewId(id)
    }

    #[test]
    fn test_chained_matches_fuse_into_one_track() {
        let mut matches = PairwiseMatches::new();
        matches.insert(v(0), v(1), vec![(3, 7)]);
        matches.insert(v(1), v(2), vec![(7, 1)]);

        let tracks = build_tracks(&matches);
        assert_eq!(tracks.len(), 1);
        let track = tracks.values().next().unwrap();
        assert_eq!(track.len(), 3);
        assert_eq!(track.feature_in(v(0)), Some(3));
        assert_eq!(track.feature_in(v(1)), Some(7));
        assert_eq!(track.feature_in(v(2)), Some(1));
    }

    #[test]
    fn test_conflicting_track_is_dropped() {
        let mut matches = PairwiseMatches::new();
        // Feature 0 of view 0 matches two different features of view 2
        // through two paths: a contradiction.
        matches.insert(v(0), v(1), vec![(0, 0)]);
        matches.insert(v(1), v(2), vec![(0, 0)]);
        matches.insert(v(0), v(2), vec![(0, 5)]);

        let tracks = build_tracks(&matches);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_pair_canonicalization_flips_indices() {
        let mut matches = PairwiseMatches::new();
        matches.insert(v(5), v(2), vec![(10, 20)]);
        let stored = matches.matches_for((v(2), v(5))).unwrap();
        assert_eq!(stored, &[(20, 10)]);
    }

    #[test]
    fn test_deterministic_track_ids() {
        let mut matches = PairwiseMatches::new();
        matches.insert(v(0), v(1), vec![(0, 0), (1, 1), (2, 2)]);
        let a = build_tracks(&matches);
        let b = build_tracks(&matches);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_tracks_per_view_index() {
        let mut matches = PairwiseMatches::new();
        matches.insert(v(0), v(1), vec![(0, 0)]);
        matches.insert(v(1), v(2), vec![(5, 5)]);
        let tracks = build_tracks(&matches);
        let index = tracks_per_view(&tracks);
        assert_eq!(index[&v(1)].len(), 2);
        assert_eq!(index[&v(0)].len(), 1);
    }
}
