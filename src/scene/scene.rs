//! The mutable scene container the engine grows.

use std::collections::BTreeMap;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::camera::Intrinsic;
use crate::geometry::Pose;

use super::landmark::Landmark;
use super::types::{IntrinsicId, PoseId, TrackId, ViewId};
use super::view::View;

/// Views, intrinsics, poses and landmarks, all keyed by their id.
///
/// `BTreeMap` keeps iteration deterministic, which matters for
/// reproducible estimation and stable test output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    pub views: BTreeMap<ViewId, View>,
    pub intrinsics: BTreeMap<IntrinsicId, Intrinsic>,
    pub poses: BTreeMap<PoseId, Pose>,
    pub landmarks: BTreeMap<TrackId, Landmark>,
}

/// Advisory summary of reprojection residual norms over the whole scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_view(&mut self, view: View) {
        self.views.insert(view.id, view);
    }

    pub fn add_intrinsic(&mut self, id: IntrinsicId, intrinsic: Intrinsic) {
        self.intrinsics.insert(id, intrinsic);
    }

    pub fn set_pose(&mut self, id: PoseId, pose: Pose) {
        self.poses.insert(id, pose);
    }

    /// A view is reconstructed once its pose slot is populated.
    pub fn is_reconstructed(&self, view: ViewId) -> bool {
        self.views
            .get(&view)
            .map_or(false, |v| self.poses.contains_key(&v.pose_id))
    }

    pub fn pose_of(&self, view: ViewId) -> Option<&Pose> {
        self.poses.get(&self.views.get(&view)?.pose_id)
    }

    pub fn intrinsic_of(&self, view: ViewId) -> Option<&Intrinsic> {
        self.intrinsics.get(&self.views.get(&view)?.intrinsic_id?)
    }

    /// Smallest intrinsic id not yet in use.
    pub fn next_intrinsic_id(&self) -> IntrinsicId {
        IntrinsicId(
            self.intrinsics
                .keys()
                .next_back()
                .map_or(0, |last| last.0 + 1),
        )
    }

    /// Reprojection residual (pixels) of one landmark observation, or
    /// `None` when the view lacks a pose or intrinsic.
    pub fn observation_residual(&self, view: ViewId, landmark: &Landmark) -> Option<Vector2<f64>> {
        let obs = landmark.observations.get(&view)?;
        let pose = self.pose_of(view)?;
        let intrinsic = self.intrinsic_of(view)?;
        let x_cam = pose.transform_point(&landmark.position);
        Some(obs.pixel - intrinsic.project(&x_cam))
    }

    /// Residual norm summary over every observation, advisory only.
    pub fn residual_stats(&self) -> Option<ResidualStats> {
        let mut norms: Vec<f64> = self
            .landmarks
            .values()
            .flat_map(|lm| {
                lm.observations
                    .keys()
                    .filter_map(|&v| self.observation_residual(v, lm))
                    .map(|r| r.norm())
                    .collect::<Vec<_>>()
            })
            .collect();
        if norms.is_empty() {
            return None;
        }
        norms.sort_by(|a, b| a.total_cmp(b));
        let count = norms.len();
        Some(ResidualStats {
            count,
            min: norms[0],
            max: norms[count - 1],
            mean: norms.iter().sum::<f64>() / count as f64,
            median: norms[count / 2],
        })
    }

    /// Structural consistency: every landmark has at least two
    /// observations and each refers to a reconstructed view.
    pub fn is_consistent(&self) -> bool {
        self.landmarks.values().all(|lm| {
            lm.num_observations() >= 2
                && lm.observations.keys().all(|&v| self.is_reconstructed(v))
        })
    }
}
