//! Landmark: a 3D point with its per-view observations.

use std::collections::HashMap;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::types::ViewId;

/// A 2D measurement of a landmark in one view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Pixel position as measured (distorted image domain).
    pub pixel: Vector2<f64>,
    /// Index of the feature in the view's feature list.
    pub feature_idx: usize,
}

impl Observation {
    pub fn new(pixel: Vector2<f64>, feature_idx: usize) -> Self {
        Self { pixel, feature_idx }
    }
}

/// A reconstructed 3D point observed by two or more views.
///
/// Landmarks are created at seeding or when a new track triangulates
/// during growth, gain and lose observations as views are added and
/// outliers pruned, and must be erased from the scene once fewer than
/// two observations remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// 3D position in world coordinates.
    pub position: Vector3<f64>,
    /// Observing views, mapped to the measurement in that view.
    pub observations: HashMap<ViewId, Observation>,
}

impl Landmark {
    pub fn new(position: Vector3<f64>) -> Self {
        Self {
            position,
            observations: HashMap::new(),
        }
    }

    /// Record or replace the observation from a view.
    pub fn add_observation(&mut self, view: ViewId, obs: Observation) {
        self.observations.insert(view, obs);
    }

    /// Remove the observation from a view. Returns true if it existed.
    pub fn remove_observation(&mut self, view: ViewId) -> bool {
        self.observations.remove(&view).is_some()
    }

    pub fn is_observed_by(&self, view: ViewId) -> bool {
        self.observations.contains_key(&view)
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }
}
