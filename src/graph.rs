//! View-pair graph filtering.
//!
//! Reconstruction only starts on views with redundant pairwise
//! connectivity: a view connected through a single bridge edge cannot be
//! cross-checked and destabilizes the seed. The filter keeps the largest
//! 2-edge-connected component of the pair graph (bridges removed, then
//! the biggest surviving connected component).

use std::collections::{BTreeSet, HashMap};

use crate::scene::ViewId;
use crate::tracks::Pair;

/// Largest 2-edge-connected component of the pair graph.
///
/// Returns the surviving view set; empty when no component with at least
/// two views exists. The operation is idempotent: filtering the pairs
/// induced by the returned set returns the same set.
pub fn largest_biedge_component(pairs: &[Pair]) -> BTreeSet<ViewId> {
    let mut node_index: HashMap<ViewId, usize> = HashMap::new();
    let mut nodes: Vec<ViewId> = Vec::new();
    let mut index_of = |v: ViewId, nodes: &mut Vec<ViewId>| -> usize {
        *node_index.entry(v).or_insert_with(|| {
            nodes.push(v);
            nodes.len() - 1
        })
    };

    let mut edges: Vec<(usize, usize)> = Vec::new();
    let mut adj: Vec<Vec<(usize, usize)>> = Vec::new();
    for &(a, b) in pairs {
        if a == b {
            continue;
        }
        let ia = index_of(a, &mut nodes);
        let ib = index_of(b, &mut nodes);
        while adj.len() < nodes.len() {
            adj.push(Vec::new());
        }
        let edge_id = edges.len();
        edges.push((ia, ib));
        adj[ia].push((ib, edge_id));
        adj[ib].push((ia, edge_id));
    }

    if nodes.is_empty() {
        return BTreeSet::new();
    }

    let bridges = find_bridges(&adj);

    // Connected components over non-bridge edges.
    let n = nodes.len();
    let mut component = vec![usize::MAX; n];
    let mut current = 0usize;
    for start in 0..n {
        if component[start] != usize::MAX {
            continue;
        }
        let mut stack = vec![start];
        component[start] = current;
        while let Some(u) = stack.pop() {
            for &(v, edge_id) in &adj[u] {
                if bridges.contains(&edge_id) || component[v] != usize::MAX {
                    continue;
                }
                component[v] = current;
                stack.push(v);
            }
        }
        current += 1;
    }

    let mut sizes = vec![0usize; current];
    for &c in &component {
        sizes[c] += 1;
    }
    let best = match (0..current).filter(|&c| sizes[c] >= 2).max_by_key(|&c| sizes[c]) {
        Some(c) => c,
        None => return BTreeSet::new(),
    };

    (0..n)
        .filter(|&i| component[i] == best)
        .map(|i| nodes[i])
        .collect()
}

/// Keep only pairs with both endpoints in the retained set.
pub fn filter_pairs(pairs: &[Pair], keep: &BTreeSet<ViewId>) -> Vec<Pair> {
    pairs
        .iter()
        .copied()
        .filter(|(a, b)| keep.contains(a) && keep.contains(b))
        .collect()
}

/// Bridge edges by iterative Tarjan low-link.
fn find_bridges(adj: &[Vec<(usize, usize)>]) -> BTreeSet<usize> {
    let n = adj.len();
    let mut disc = vec![usize::MAX; n];
    let mut low = vec![usize::MAX; n];
    let mut timer = 0usize;
    let mut bridges = BTreeSet::new();

    // Frame: (node, incoming edge id, next adjacency slot).
    for root in 0..n {
        if disc[root] != usize::MAX {
            continue;
        }
        let mut stack: Vec<(usize, usize, usize)> = vec![(root, usize::MAX, 0)];
        disc[root] = timer;
        low[root] = timer;
        timer += 1;

        while let Some(&mut (u, in_edge, ref mut slot)) = stack.last_mut() {
            if *slot < adj[u].len() {
                let (v, edge_id) = adj[u][*slot];
                *slot += 1;
                if edge_id == in_edge {
                    continue;
                }
                if disc[v] == usize::MAX {
                    disc[v] = timer;
                    low[v] = timer;
                    timer += 1;
                    stack.push((v, edge_id, 0));
                } else {
                    low[u] = low[u].min(disc[v]);
                }
            } else {
                stack.pop();
                if let Some(&(parent, _, _)) = stack.last() {
                    low[parent] = low[parent].min(low[u]);
                    if low[u] > disc[parent] {
                        bridges.insert(in_edge);
                    }
                }
            }
        }
    }
    bridges
}
