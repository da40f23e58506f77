//! Growth: resection-candidate selection, per-view resection and
//! new-track triangulation.

use std::collections::BTreeSet;

use nalgebra::Vector2;
use parking_lot::Mutex;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ba::{refine_pose, BaError};
use crate::camera::{Intrinsic, Pinhole};
use crate::estimation::{Correspondence2D3D, EstimationError};
use crate::geometry::{ray_angle_degrees, triangulate_dlt, Pose};
use crate::scene::{Landmark, Observation, TrackId, ViewId};

use super::ReconstructionEngine;

/// Recoverable per-view resection failures; the view is dropped from
/// the pool and the growth loop continues.
#[derive(Debug, Error)]
pub(crate) enum ResectError {
    #[error("no 2D-3D correspondences")]
    NoCorrespondences,
    #[error("localization failed")]
    Localization(#[source] EstimationError),
    #[error("pose refinement failed")]
    Refinement(#[source] BaError),
}

/// Floor applied to the per-view residual threshold during new-track
/// triangulation.
const TRIANGULATION_THRESHOLD_FLOOR: f64 = 4.0;

/// Best view plus every view scoring at least `ratio` of the best.
///
/// `scores` must be sorted descending. Lowering the ratio never shrinks
/// the selection.
pub(crate) fn select_candidate_group(scores: &[(ViewId, usize)], ratio: f64) -> Vec<ViewId> {
    let best = match scores.first() {
        Some(&(_, best)) if best > 0 => best as f64,
        _ => return Vec::new(),
    };
    scores
        .iter()
        .filter(|(_, score)| *score as f64 >= ratio * best)
        .map(|&(view, _)| view)
        .collect()
}

impl ReconstructionEngine<'_> {
    /// Views eligible for resection this round.
    ///
    /// Unrestricted mode considers every remaining view. Windowed mode
    /// bounds candidates to reconstructed view ids plus the current
    /// half-width, widening the window whenever it comes up empty.
    pub(crate) fn select_resection_candidates(&mut self) -> Vec<ViewId> {
        loop {
            let active = self.active_views();
            if active.is_empty() {
                return Vec::new();
            }

            let landmark_ids: BTreeSet<TrackId> = self.scene.landmarks.keys().copied().collect();
            let mut scores: Vec<(ViewId, usize)> = active
                .par_iter()
                .map(|&view| {
                    let count = self
                        .tracks_per_view
                        .get(&view)
                        .map_or(0, |t| t.intersection(&landmark_ids).count());
                    (view, count)
                })
                .collect();
            scores.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            if scores.first().map_or(0, |&(_, s)| s) == 0 {
                // Nothing resectable in the window; widen before giving
                // up if the window is not already covering everything.
                if self.config.window.is_some() && active.len() < self.remaining.len() {
                    self.widen_window();
                    continue;
                }
                return Vec::new();
            }

            let group = select_candidate_group(&scores, self.config.resection_group_ratio);
            debug!(
                candidates = group.len(),
                best_score = scores[0].1,
                "resection batch"
            );
            return group;
        }
    }

    fn active_views(&mut self) -> Vec<ViewId> {
        if self.config.window.is_none() {
            return self.remaining.iter().copied().collect();
        }
        loop {
            if self.remaining.is_empty() {
                return Vec::new();
            }
            let (lo, hi) = match (
                self.reconstructed.iter().next(),
                self.reconstructed.iter().next_back(),
            ) {
                (Some(first), Some(last)) => (
                    first.0.saturating_sub(self.window_width),
                    last.0.saturating_add(self.window_width),
                ),
                _ => return self.remaining.iter().copied().collect(),
            };
            let active: Vec<ViewId> = self
                .remaining
                .range(ViewId(lo)..=ViewId(hi))
                .copied()
                .collect();
            // Remaining is the single source of truth, so a
            // reconstructed view must never be re-admitted.
            debug_assert!(active.iter().all(|v| !self.reconstructed.contains(v)));
            if !active.is_empty() {
                return active;
            }
            self.widen_window();
        }
    }

    fn widen_window(&mut self) {
        self.window_width = self.window_width.saturating_mul(2).max(1);
        debug!(width = self.window_width, "window widened");
    }

    /// Resect one view; logs and swallows recoverable failures.
    pub(crate) fn resect_view(&mut self, view: ViewId) -> bool {
        match self.try_resect(view) {
            Ok(()) => true,
            Err(err) => {
                warn!(view = %view, error = %err, "resection skipped");
                false
            }
        }
    }

    fn try_resect(&mut self, view: ViewId) -> Result<(), ResectError> {
        // 2D-3D correspondences: the view's tracks that already carry a
        // landmark.
        let features = self.features.features(view);
        let mut track_ids = Vec::new();
        let mut raw = Vec::new();
        if let Some(tracks) = self.tracks_per_view.get(&view) {
            for &track_id in tracks {
                if let Some(lm) = self.scene.landmarks.get(&track_id) {
                    let feat = match self.tracks[&track_id].feature_in(view) {
                        Some(f) => f,
                        None => continue,
                    };
                    track_ids.push((track_id, feat));
                    raw.push(Correspondence2D3D {
                        pixel: features[feat],
                        point: lm.position,
                    });
                }
            }
        }
        if raw.is_empty() {
            return Err(ResectError::NoCorrespondences);
        }

        let intrinsic = self.scene.intrinsic_of(view).cloned();

        // Undistort before localization when calibration is known.
        let localization_data: Vec<Correspondence2D3D> = match &intrinsic {
            Some(cam) if cam.has_distortion() => raw
                .iter()
                .map(|c| Correspondence2D3D {
                    pixel: cam.undistort_pixel(c.pixel),
                    point: c.point,
                })
                .collect(),
            _ => raw.clone(),
        };

        let k = intrinsic.as_ref().map(|cam| cam.k());
        let localization = self
            .localizer
            .localize(&localization_data, k.as_ref())
            .map_err(ResectError::Localization)?;

        // Existing intrinsic, or one derived from the projection matrix
        // when the view was uncalibrated.
        let (cam, new_intrinsic) = match intrinsic {
            Some(cam) => (cam, false),
            None => {
                let k = localization.k;
                let focal = (k[(0, 0)] + k[(1, 1)]) / 2.0;
                (
                    Intrinsic::Pinhole(Pinhole::new(focal, k[(0, 2)], k[(1, 2)])),
                    true,
                )
            }
        };

        // Pose polish over the inlier set, intrinsics held fixed.
        let inlier_data: Vec<Correspondence2D3D> =
            localization.inliers.iter().map(|&i| raw[i]).collect();
        let pose = refine_pose(
            &localization.pose,
            &cam,
            &inlier_data,
            self.config.refine_iterations,
        )
        .map_err(ResectError::Refinement)?;

        // Commit.
        let threshold = localization.threshold_px.max(1.0);
        let pose_id = self.scene.views[&view].pose_id;
        if new_intrinsic {
            let id = self.scene.next_intrinsic_id();
            self.scene.add_intrinsic(id, cam.clone());
            if let Some(v) = self.scene.views.get_mut(&view) {
                v.intrinsic_id = Some(id);
            }
        }
        self.scene.set_pose(pose_id, pose.clone());
        self.view_thresholds.insert(view, threshold);

        // Extend structure: keep each correspondence as an observation
        // when it reprojects within the localization threshold and sits
        // in front of the camera.
        let mut extended = 0usize;
        for ((track_id, feat), corr) in track_ids.iter().zip(&raw) {
            if pose.depth(&corr.point) <= 0.0 {
                continue;
            }
            let residual = corr.pixel - cam.project(&pose.transform_point(&corr.point));
            if residual.norm() < threshold {
                if let Some(lm) = self.scene.landmarks.get_mut(track_id) {
                    lm.add_observation(view, Observation::new(corr.pixel, *feat));
                    extended += 1;
                }
            }
        }

        let created = self.triangulate_new_tracks(view);
        info!(
            view = %view,
            correspondences = raw.len(),
            inliers = localization.inliers.len(),
            extended,
            created,
            threshold_px = threshold,
            "view resected"
        );
        Ok(())
    }

    /// Triangulate tracks of the freshly resected view against every
    /// reconstructed partner view, in parallel per partner. Landmark
    /// upserts are id-keyed and idempotent; the map is guarded by a
    /// mutex so at most one writer mutates a landmark at a time.
    fn triangulate_new_tracks(&mut self, new_view: ViewId) -> usize {
        let new_tracks = match self.tracks_per_view.get(&new_view) {
            Some(t) => t.clone(),
            None => return 0,
        };
        let view_data = |view: ViewId| -> Option<(Pose, Intrinsic, f64)> {
            let pose = self.scene.pose_of(view)?.clone();
            let cam = self.scene.intrinsic_of(view)?.clone();
            let threshold = self
                .view_thresholds
                .get(&view)
                .copied()
                .unwrap_or(TRIANGULATION_THRESHOLD_FLOOR)
                .max(TRIANGULATION_THRESHOLD_FLOOR);
            Some((pose, cam, threshold))
        };

        let (pose_n, cam_n, thr_n) = match view_data(new_view) {
            Some(d) => d,
            None => return 0,
        };
        let partners: Vec<(ViewId, (Pose, Intrinsic, f64))> = self
            .reconstructed
            .iter()
            .filter(|&&j| j != new_view)
            .filter_map(|&j| view_data(j).map(|d| (j, d)))
            .collect();

        let features_n = self.features.features(new_view);
        let min_parallax = self.config.min_parallax_deg;
        let tracks = &self.tracks;
        let tracks_per_view = &self.tracks_per_view;
        let features = self.features;
        let landmarks = Mutex::new(&mut self.scene.landmarks);
        let created = Mutex::new(0usize);

        partners.par_iter().for_each(|(j, (pose_j, cam_j, thr_j))| {
            let shared: Vec<TrackId> = match tracks_per_view.get(j) {
                Some(tj) => new_tracks.intersection(tj).copied().collect(),
                None => return,
            };
            let features_j = features.features(*j);
            let c_n = pose_n.center();
            let c_j = pose_j.center();

            for track_id in shared {
                let track = &tracks[&track_id];
                let (feat_n, feat_j) =
                    match (track.feature_in(new_view), track.feature_in(*j)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => continue,
                    };
                let px_n = features_n[feat_n];
                let px_j = features_j[feat_j];

                // Existing landmark: add whichever of the two
                // observations is missing, each under the same
                // depth/residual test.
                let existing = {
                    let guard = landmarks.lock();
                    guard.get(&track_id).map(|lm| {
                        (
                            lm.is_observed_by(new_view),
                            lm.is_observed_by(*j),
                            lm.position,
                        )
                    })
                };
                if let Some((has_new, has_partner, position)) = existing {
                    if !has_new
                        && pose_n.depth(&position) > 0.0
                        && residual(&cam_n, &pose_n, &position, &px_n).norm() < thr_n
                    {
                        let mut guard = landmarks.lock();
                        if let Some(lm) = guard.get_mut(&track_id) {
                            lm.add_observation(new_view, Observation::new(px_n, feat_n));
                        }
                    }
                    if !has_partner
                        && pose_j.depth(&position) > 0.0
                        && residual(cam_j, pose_j, &position, &px_j).norm() < *thr_j
                    {
                        let mut guard = landmarks.lock();
                        if let Some(lm) = guard.get_mut(&track_id) {
                            lm.add_observation(*j, Observation::new(px_j, feat_j));
                        }
                    }
                    continue;
                }

                let xn_n = cam_n.bearing(px_n);
                let xn_j = cam_j.bearing(px_j);
                let p = match triangulate_dlt(&xn_n, &xn_j, &pose_n, pose_j) {
                    Some(p) => p,
                    None => continue,
                };
                if ray_angle_degrees(&c_n, &c_j, &p) <= min_parallax {
                    continue;
                }
                if pose_n.depth(&p) <= 0.0 || pose_j.depth(&p) <= 0.0 {
                    continue;
                }
                if residual(&cam_n, &pose_n, &p, &px_n).norm() >= thr_n
                    || residual(cam_j, pose_j, &p, &px_j).norm() >= *thr_j
                {
                    continue;
                }

                let mut guard = landmarks.lock();
                let lm = guard.entry(track_id).or_insert_with(|| {
                    *created.lock() += 1;
                    Landmark::new(p)
                });
                lm.add_observation(new_view, Observation::new(px_n, feat_n));
                lm.add_observation(*j, Observation::new(px_j, feat_j));
            }
        });

        let created = *created.lock();
        if created > 0 {
            debug!(view = %new_view, created, "new tracks triangulated");
        }
        created
    }
}

fn residual(
    cam: &Intrinsic,
    pose: &Pose,
    point: &nalgebra::Vector3<f64>,
    pixel: &Vector2<f64>,
) -> Vector2<f64> {
    pixel - cam.project(&pose.transform_point(point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Pinhole;
    use crate::engine::EngineConfig;
    use crate::scene::{IntrinsicId, PoseId, Scene, View};
    use crate::tracks::{build_tracks, tracks_per_view, FeatureTable, FeaturesProvider, PairwiseMatches};
    use nalgebra::{Matrix3, Vector3};

    fn scores(values: &[usize]) -> Vec<(ViewId, usize)> {
        values
            .iter()
            .enumerate()
            .map(|(i, &s)| (ViewId(i as u32), s))
            .collect()
    }

    #[test]
    fn test_group_keeps_best_and_near_best() {
        let group = select_candidate_group(&scores(&[100, 80, 74, 10]), 0.75);
        assert_eq!(group, vec![ViewId(0), ViewId(1)]);
    }

    #[test]
    fn test_group_empty_when_best_is_zero() {
        assert!(select_candidate_group(&scores(&[0, 0]), 0.75).is_empty());
        assert!(select_candidate_group(&[], 0.75).is_empty());
    }

    const FOCAL: f64 = 500.0;

    fn project(pose: &Pose, p: &Vector3<f64>) -> Vector2<f64> {
        let pc = pose.transform_point(p);
        Vector2::new(FOCAL * pc.x / pc.z + 320.0, FOCAL * pc.y / pc.z + 240.0)
    }

    #[test]
    fn test_resection_backfills_partner_observations() {
        let points: Vec<Vector3<f64>> = (0..20)
            .map(|i| {
                Vector3::new(
                    (i % 5) as f64 * 0.4 - 0.8,
                    (i / 5) as f64 * 0.4 - 0.6,
                    5.0 + (i % 3) as f64 * 0.5,
                )
            })
            .collect();
        let poses = [
            Pose::identity(),
            Pose::from_rt(Matrix3::identity(), Vector3::new(-0.5, 0.0, 0.0)),
            Pose::from_rt(Matrix3::identity(), Vector3::new(-1.0, 0.0, 0.0)),
        ];

        let mut scene = Scene::new();
        scene.add_intrinsic(
            IntrinsicId(0),
            Intrinsic::Pinhole(Pinhole::new(FOCAL, 320.0, 240.0)),
        );
        let mut features = FeatureTable::new();
        for v in 0..3u32 {
            scene.add_view(View::new(ViewId(v), Some(IntrinsicId(0)), 640, 480));
            features.insert(
                ViewId(v),
                points.iter().map(|p| project(&poses[v as usize], p)).collect(),
            );
        }
        scene.set_pose(PoseId(0), poses[0].clone());
        scene.set_pose(PoseId(1), poses[1].clone());

        let mut matches = PairwiseMatches::new();
        for (a, b) in [(0u32, 1u32), (0, 2), (1, 2)] {
            matches.insert(
                ViewId(a),
                ViewId(b),
                (0..points.len()).map(|i| (i, i)).collect(),
            );
        }
        let tracks = build_tracks(&matches);

        // Every track except one is already a landmark seen by views 0
        // and 1; the held-out track only becomes structure during the
        // resection of view 2.
        let held_out = TrackId(7);
        for (&id, track) in &tracks {
            if id == held_out {
                continue;
            }
            let mut lm = Landmark::new(points[id.0 as usize]);
            for v in 0..2u32 {
                let feat = track.feature_in(ViewId(v)).unwrap();
                lm.add_observation(
                    ViewId(v),
                    Observation::new(features.features(ViewId(v))[feat], feat),
                );
            }
            scene.landmarks.insert(id, lm);
        }

        let mut engine =
            ReconstructionEngine::new(scene, &features, &matches, EngineConfig::default());
        engine.tracks_per_view = tracks_per_view(&tracks);
        engine.tracks = tracks;
        engine.reconstructed = [ViewId(0), ViewId(1)].into_iter().collect();
        engine.remaining = [ViewId(2)].into_iter().collect();
        engine.view_thresholds.insert(ViewId(0), 4.0);
        engine.view_thresholds.insert(ViewId(1), 4.0);

        assert!(engine.resect_view(ViewId(2)));

        // The held-out track triangulates against one partner and must
        // still pick up the other partner's observation, regardless of
        // which partner got there first.
        let lm = &engine.scene.landmarks[&held_out];
        assert_eq!(lm.num_observations(), 3);
        for v in 0..3u32 {
            assert!(lm.is_observed_by(ViewId(v)));
        }
    }

    #[test]
    fn test_lowering_ratio_never_shrinks_group() {
        let s = scores(&[100, 90, 75, 60, 40, 5]);
        let mut previous = select_candidate_group(&s, 1.0);
        for ratio in [0.9, 0.75, 0.5, 0.25, 0.0] {
            let group = select_candidate_group(&s, ratio);
            assert!(group.len() >= previous.len());
            assert!(previous.iter().all(|v| group.contains(v)));
            previous = group;
        }
    }
}
