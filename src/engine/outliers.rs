//! Outlier rejection and stability cleanup over a scene.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::geometry::ray_angle_degrees;
use crate::scene::{PoseId, Scene, ViewId};

/// Two rejection passes over every landmark.
///
/// First, observations whose reprojection residual exceeds
/// `pixel_threshold` on either axis are removed. Second, landmarks whose
/// widest pairwise triangulation angle stays below `min_angle_deg` are
/// erased entirely. Landmarks left with fewer than two observations are
/// erased too. Returns the number of removed observations plus erased
/// landmarks.
pub fn reject_outliers(scene: &mut Scene, pixel_threshold: f64, min_angle_deg: f64) -> usize {
    let mut removed = 0usize;

    // Residual pass.
    let mut to_remove: Vec<(crate::scene::TrackId, Vec<ViewId>)> = Vec::new();
    for (&track_id, lm) in &scene.landmarks {
        let bad: Vec<ViewId> = lm
            .observations
            .keys()
            .filter(|&&view| match scene.observation_residual(view, lm) {
                Some(r) => r.x.abs() > pixel_threshold || r.y.abs() > pixel_threshold,
                None => true,
            })
            .copied()
            .collect();
        if !bad.is_empty() {
            to_remove.push((track_id, bad));
        }
    }
    for (track_id, views) in to_remove {
        if let Some(lm) = scene.landmarks.get_mut(&track_id) {
            for view in views {
                if lm.remove_observation(view) {
                    removed += 1;
                }
            }
        }
    }

    // Angle pass: a track observed only under near-parallel rays has an
    // unreliable depth.
    let mut centers: HashMap<ViewId, nalgebra::Vector3<f64>> = HashMap::new();
    for &view in scene.views.keys() {
        if let Some(pose) = scene.pose_of(view) {
            centers.insert(view, pose.center());
        }
    }
    let weak: Vec<crate::scene::TrackId> = scene
        .landmarks
        .iter()
        .filter(|(_, lm)| {
            let views: Vec<ViewId> = lm
                .observations
                .keys()
                .filter(|v| centers.contains_key(v))
                .copied()
                .collect();
            let mut max_angle = 0.0f64;
            for (i, &a) in views.iter().enumerate() {
                for &b in &views[i + 1..] {
                    let angle = ray_angle_degrees(&centers[&a], &centers[&b], &lm.position);
                    max_angle = max_angle.max(angle);
                }
            }
            max_angle < min_angle_deg
        })
        .map(|(&id, _)| id)
        .collect();
    removed += weak.len();
    for id in weak {
        scene.landmarks.remove(&id);
    }

    scene.landmarks.retain(|_, lm| lm.num_observations() >= 2);

    if removed > 0 {
        debug!(removed, "outlier rejection");
    }
    removed
}

/// Erase poses observed by fewer than `min_landmarks` landmarks, then
/// drop observations referencing pose-less views and landmarks left
/// with fewer than two observations. Repeats until the scene stops
/// changing. Returns true when anything was erased.
pub fn erase_unstable(scene: &mut Scene, min_landmarks: usize) -> bool {
    let mut changed = false;
    loop {
        // Landmark support per pose.
        let mut support: HashMap<PoseId, usize> = HashMap::new();
        for lm in scene.landmarks.values() {
            for &view in lm.observations.keys() {
                if let Some(v) = scene.views.get(&view) {
                    if scene.poses.contains_key(&v.pose_id) {
                        *support.entry(v.pose_id).or_insert(0) += 1;
                    }
                }
            }
        }
        let unstable: HashSet<PoseId> = scene
            .poses
            .keys()
            .filter(|id| support.get(id).copied().unwrap_or(0) < min_landmarks)
            .copied()
            .collect();
        if unstable.is_empty() {
            return changed;
        }
        changed = true;
        for id in &unstable {
            scene.poses.remove(id);
        }

        // Observations of a view without a pose are meaningless.
        let poseless: HashSet<ViewId> = scene
            .views
            .iter()
            .filter(|(_, v)| !scene.poses.contains_key(&v.pose_id))
            .map(|(&id, _)| id)
            .collect();
        for lm in scene.landmarks.values_mut() {
            lm.observations.retain(|view, _| !poseless.contains(view));
        }
        scene.landmarks.retain(|_, lm| lm.num_observations() >= 2);
    }
}
