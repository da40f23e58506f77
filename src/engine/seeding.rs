//! Seed-pair selection and the two-view bootstrap.

use nalgebra::Vector2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::ba::{BaOptions, IntrinsicPolicy};
use crate::geometry::{ray_angle_degrees, triangulate_dlt, Pose};
use crate::scene::{Landmark, Observation, Scene, TrackId, ViewId};
use crate::tracks::{make_pair, Pair};

use super::{EngineError, ReconstructionEngine};

/// A seed candidate that passed the automatic qualification tests.
#[derive(Debug, Clone, Copy)]
pub struct ScoredPair {
    pub pair: Pair,
    /// Median triangulation angle over the two-view inliers, degrees.
    pub median_angle_deg: f64,
    pub inlier_count: usize,
}

/// Injected seed-pair policy.
///
/// The engine never blocks on interactive input: when automatic ranking
/// finds nothing, the strategy decides whether a fallback pair exists.
pub trait SeedStrategy: Send + Sync {
    /// Pick from the qualified pairs, ranked by median angle descending.
    fn select(&self, ranked: &[ScoredPair]) -> Option<Pair> {
        ranked.first().map(|s| s.pair)
    }

    /// Last resort, offered the pairs with the most matches (best
    /// first). Returning `None` fails the run.
    fn fallback(&self, by_match_count: &[(Pair, usize)]) -> Option<Pair>;
}

/// Automatic ranking only; no fallback.
pub struct AutomaticSeed;

impl SeedStrategy for AutomaticSeed {
    fn fallback(&self, _by_match_count: &[(Pair, usize)]) -> Option<Pair> {
        None
    }
}

/// Automatic ranking with a pre-configured fallback pair.
pub struct PresetSeed(pub Pair);

impl SeedStrategy for PresetSeed {
    fn fallback(&self, _by_match_count: &[(Pair, usize)]) -> Option<Pair> {
        Some(self.0)
    }
}

/// Fallback delegated to a caller-supplied closure, e.g. an application
/// prompting its user with the offered list.
pub struct CallbackSeed(pub Box<dyn Fn(&[(Pair, usize)]) -> Option<Pair> + Send + Sync>);

impl SeedStrategy for CallbackSeed {
    fn fallback(&self, by_match_count: &[(Pair, usize)]) -> Option<Pair> {
        (self.0)(by_match_count)
    }
}

/// How many high-match-count pairs the fallback gets offered.
const FALLBACK_CANDIDATES: usize = 10;

impl ReconstructionEngine<'_> {
    /// Tracks observed by both views, in id order.
    pub(crate) fn common_tracks(&self, a: ViewId, b: ViewId) -> Vec<TrackId> {
        match (self.tracks_per_view.get(&a), self.tracks_per_view.get(&b)) {
            (Some(ta), Some(tb)) => ta.intersection(tb).copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Automatic seed-pair choice with the strategy fallback.
    pub(crate) fn choose_seed_pair(&mut self) -> Result<Pair, EngineError> {
        let mut ranked: Vec<ScoredPair> = self
            .filtered_pairs
            .par_iter()
            .filter_map(|&pair| self.score_seed_pair(pair))
            .collect();
        ranked.sort_by(|a, b| {
            b.median_angle_deg
                .total_cmp(&a.median_angle_deg)
                .then(a.pair.cmp(&b.pair))
        });

        for scored in &ranked {
            debug!(
                pair = ?(scored.pair.0 .0, scored.pair.1 .0),
                angle = scored.median_angle_deg,
                inliers = scored.inlier_count,
                "seed candidate"
            );
        }

        if let Some(pair) = self.seed_strategy.select(&ranked) {
            info!(pair = ?(pair.0 .0, pair.1 .0), "seed pair selected");
            return Ok(pair);
        }

        let mut by_count: Vec<(Pair, usize)> = self
            .filtered_pairs
            .iter()
            .map(|&pair| (pair, self.common_tracks(pair.0, pair.1).len()))
            .collect();
        by_count.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        by_count.truncate(FALLBACK_CANDIDATES);

        match self.seed_strategy.fallback(&by_count) {
            Some(pair) => {
                info!(pair = ?(pair.0 .0, pair.1 .0), "seed pair from fallback");
                Ok(pair)
            }
            None => Err(EngineError::NoSeedPair),
        }
    }

    /// Qualify one pair: both views calibrated, enough two-view inliers,
    /// median triangulation angle strictly inside the configured range.
    fn score_seed_pair(&self, pair: Pair) -> Option<ScoredPair> {
        let (i, j) = pair;
        let cam_i = self.scene.intrinsic_of(i)?.clone();
        let cam_j = self.scene.intrinsic_of(j)?.clone();

        let tracks = self.common_tracks(i, j);
        if tracks.len() < self.config.min_seed_inliers {
            return None;
        }

        let (x_i, x_j) = self.track_pixels(&tracks, i, j);
        let estimate = self
            .two_view
            .estimate(&x_i, &x_j, &cam_i.k(), &cam_j.k())
            .ok()?;
        if estimate.inliers.len() < self.config.min_seed_inliers {
            return None;
        }

        let pose_i = Pose::identity();
        let pose_j = &estimate.pose;
        let c_i = pose_i.center();
        let c_j = pose_j.center();
        let mut angles: Vec<f64> = estimate
            .inliers
            .iter()
            .filter_map(|&idx| {
                let xn_i = cam_i.bearing(x_i[idx]);
                let xn_j = cam_j.bearing(x_j[idx]);
                let p = triangulate_dlt(&xn_i, &xn_j, &pose_i, pose_j)?;
                Some(ray_angle_degrees(&c_i, &c_j, &p))
            })
            .collect();
        if angles.is_empty() {
            return None;
        }
        angles.sort_by(|a, b| a.total_cmp(b));
        let median = angles[angles.len() / 2];

        let (lo, hi) = self.config.seed_angle_range;
        if median > lo && median < hi {
            Some(ScoredPair {
                pair,
                median_angle_deg: median,
                inlier_count: estimate.inliers.len(),
            })
        } else {
            None
        }
    }

    /// Pixel positions of the given tracks in two views.
    fn track_pixels(
        &self,
        tracks: &[TrackId],
        a: ViewId,
        b: ViewId,
    ) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let feats_a = self.features.features(a);
        let feats_b = self.features.features(b);
        let mut x_a = Vec::with_capacity(tracks.len());
        let mut x_b = Vec::with_capacity(tracks.len());
        for id in tracks {
            let track = &self.tracks[id];
            if let (Some(fa), Some(fb)) = (track.feature_in(a), track.feature_in(b)) {
                x_a.push(feats_a[fa]);
                x_b.push(feats_b[fb]);
            }
        }
        (x_a, x_b)
    }

    /// Bootstrap the two-view reconstruction from the chosen pair.
    ///
    /// The pair is canonicalized so the smaller id becomes the identity
    /// reference; seeding with (J, I) therefore produces the same
    /// structure as (I, J).
    pub(crate) fn seed(&mut self, pair: Pair) -> Result<(), EngineError> {
        let (i, j) = make_pair(pair.0, pair.1);

        let tracks = self.common_tracks(i, j);
        let (x_i, x_j) = self.track_pixels(&tracks, i, j);
        debug_assert_eq!(x_i.len(), tracks.len());

        let cam_i = self
            .scene
            .intrinsic_of(i)
            .cloned()
            .ok_or(EngineError::NoSeedPair)?;
        let cam_j = self
            .scene
            .intrinsic_of(j)
            .cloned()
            .ok_or(EngineError::NoSeedPair)?;

        let estimate = self
            .two_view
            .estimate(&x_i, &x_j, &cam_i.k(), &cam_j.k())
            .map_err(EngineError::SeedEstimation)?;
        let precision = estimate.precision_px.max(1.0);

        // Two-view sub-scene: reference at identity, every common track
        // triangulated, then jointly refined with intrinsics fixed. The
        // acceptance filter below decides admission, so tracks the
        // estimator scored as outliers still get their chance.
        let pose_i = Pose::identity();
        let pose_j = estimate.pose.clone();

        let mut sub = Scene::new();
        for view in [i, j] {
            let v = self.scene.views[&view].clone();
            if let Some(k_id) = v.intrinsic_id {
                sub.add_intrinsic(k_id, self.scene.intrinsics[&k_id].clone());
            }
            sub.add_view(v);
        }
        sub.set_pose(self.scene.views[&i].pose_id, pose_i.clone());
        sub.set_pose(self.scene.views[&j].pose_id, pose_j.clone());

        for idx in 0..tracks.len() {
            let track_id = tracks[idx];
            let track = &self.tracks[&track_id];
            let xn_i = cam_i.bearing(x_i[idx]);
            let xn_j = cam_j.bearing(x_j[idx]);
            if let Some(p) = triangulate_dlt(&xn_i, &xn_j, &pose_i, &pose_j) {
                let mut lm = Landmark::new(p);
                lm.add_observation(i, Observation::new(x_i[idx], track.feature_in(i).unwrap()));
                lm.add_observation(j, Observation::new(x_j[idx], track.feature_in(j).unwrap()));
                sub.landmarks.insert(track_id, lm);
            }
        }
        if sub.landmarks.is_empty() {
            return Err(EngineError::EmptySeedStructure);
        }

        let ba_options = BaOptions {
            refine_poses: true,
            refine_structure: true,
            intrinsic_policy: IntrinsicPolicy::Fixed,
            ..self.config.ba.clone()
        };
        self.ba
            .adjust(&mut sub, &ba_options)
            .map_err(EngineError::SeedRefinement)?;

        // Admit only well-conditioned points: enough parallax, positive
        // depth in both views, residuals within the estimator precision.
        let pose_i = sub.poses[&self.scene.views[&i].pose_id].clone();
        let pose_j = sub.poses[&self.scene.views[&j].pose_id].clone();
        let c_i = pose_i.center();
        let c_j = pose_j.center();

        let mut accepted = 0usize;
        for (track_id, lm) in &sub.landmarks {
            let p = lm.position;
            if ray_angle_degrees(&c_i, &c_j, &p) <= self.config.min_parallax_deg {
                continue;
            }
            if pose_i.depth(&p) <= 0.0 || pose_j.depth(&p) <= 0.0 {
                continue;
            }
            let r_i = sub.observation_residual(i, lm);
            let r_j = sub.observation_residual(j, lm);
            match (r_i, r_j) {
                (Some(r_i), Some(r_j)) if r_i.norm() < precision && r_j.norm() < precision => {}
                _ => continue,
            }
            self.scene.landmarks.insert(*track_id, lm.clone());
            accepted += 1;
        }
        if accepted == 0 {
            return Err(EngineError::EmptySeedStructure);
        }

        self.scene.set_pose(self.scene.views[&i].pose_id, pose_i);
        self.scene.set_pose(self.scene.views[&j].pose_id, pose_j);
        self.view_thresholds.insert(i, precision);
        self.view_thresholds.insert(j, precision);
        self.remaining.remove(&i);
        self.remaining.remove(&j);
        self.reconstructed.insert(i);
        self.reconstructed.insert(j);

        info!(
            reference = %i,
            second = %j,
            landmarks = accepted,
            precision_px = precision,
            "seeded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: u32) -> ViewId {
        ViewId(id)
    }

    #[test]
    fn test_automatic_strategy_takes_top_ranked() {
        let ranked = [
            ScoredPair {
                pair: (v(1), v(2)),
                median_angle_deg: 20.0,
                inlier_count: 150,
            },
            ScoredPair {
                pair: (v(0), v(1)),
                median_angle_deg: 8.0,
                inlier_count: 200,
            },
        ];
        assert_eq!(AutomaticSeed.select(&ranked), Some((v(1), v(2))));
        assert_eq!(AutomaticSeed.fallback(&[]), None);
    }

    #[test]
    fn test_preset_strategy_fallback() {
        let strategy = PresetSeed((v(3), v(4)));
        assert_eq!(strategy.select(&[]), None);
        assert_eq!(strategy.fallback(&[]), Some((v(3), v(4))));
    }

    #[test]
    fn test_seed_triangulates_all_common_tracks() {
        use crate::camera::{Intrinsic, Pinhole};
        use crate::engine::EngineConfig;
        use crate::estimation::RansacOptions;
        use crate::scene::{IntrinsicId, View};
        use crate::tracks::{build_tracks, tracks_per_view, FeatureTable, PairwiseMatches};
        use nalgebra::{Matrix3, Vector3};

        const FOCAL: f64 = 500.0;
        let points: Vec<Vector3<f64>> = (0..33)
            .map(|i| {
                Vector3::new(
                    (i % 6) as f64 * 0.3 - 0.75,
                    ((i / 6) % 6) as f64 * 0.3 - 0.75,
                    5.0 + (i % 7) as f64 * 0.4,
                )
            })
            .collect();
        let pose_i = Pose::identity();
        let pose_j = Pose::from_rt(Matrix3::identity(), Vector3::new(-0.9, 0.0, 0.0));
        let project = |pose: &Pose, p: &Vector3<f64>| {
            let pc = pose.transform_point(p);
            Vector2::new(FOCAL * pc.x / pc.z + 320.0, FOCAL * pc.y / pc.z + 240.0)
        };

        let mut scene = Scene::new();
        scene.add_intrinsic(
            IntrinsicId(0),
            Intrinsic::Pinhole(Pinhole::new(FOCAL, 320.0, 240.0)),
        );
        let mut features = FeatureTable::new();
        for (view, pose) in [(v(0), &pose_i), (v(1), &pose_j)] {
            scene.add_view(View::new(view, Some(IntrinsicId(0)), 640, 480));
            let mut feats: Vec<Vector2<f64>> =
                points.iter().map(|p| project(pose, p)).collect();
            // Sub-pixel offsets in the second view: outliers under a
            // tight estimator threshold, but well inside the seeding
            // admission bound.
            if view == v(1) {
                for idx in [5usize, 15, 25] {
                    feats[idx].y += 0.5;
                }
            }
            features.insert(view, feats);
        }
        let mut matches = PairwiseMatches::new();
        matches.insert(v(0), v(1), (0..points.len()).map(|i| (i, i)).collect());
        let tracks = build_tracks(&matches);

        let config = EngineConfig {
            ransac: RansacOptions {
                threshold: 0.1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut engine = ReconstructionEngine::new(scene, &features, &matches, config);
        engine.tracks_per_view = tracks_per_view(&tracks);
        engine.tracks = tracks;
        engine.remaining = [v(0), v(1)].into_iter().collect();

        engine.seed((v(0), v(1))).unwrap();

        // Every common track reaches the admission filter, including
        // the offset ones the robust estimator excluded from its
        // consensus set.
        assert_eq!(engine.scene.landmarks.len(), 33);
        for idx in [5u32, 15, 25] {
            assert!(engine.scene.landmarks.contains_key(&TrackId(idx)));
        }
    }

    #[test]
    fn test_callback_strategy_sees_offered_pairs() {
        let strategy = CallbackSeed(Box::new(|offered| offered.get(1).map(|&(p, _)| p)));
        let offered = [((v(0), v(1)), 300), ((v(1), v(2)), 250)];
        assert_eq!(strategy.fallback(&offered), Some((v(1), v(2))));
    }
}
