//! Robust estimation: the RANSAC core and the two estimator seams the
//! engine depends on (two-view relative pose, 2D-3D localization).

pub mod localizer;
pub mod ransac;
pub mod relative_pose;

use nalgebra::{Vector2, Vector3};
use thiserror::Error;

pub use localizer::{Localization, Localizer, PnpRansac};
pub use ransac::{ransac, Estimator, RansacOptions, RansacResult};
pub use relative_pose::{EssentialRansac, RelativePose, TwoViewEstimator};

#[derive(Debug, Error)]
pub enum EstimationError {
    #[error("not enough correspondences: {found} < {needed}")]
    NotEnoughData { found: usize, needed: usize },
    #[error("no consensus reached after {0} iterations")]
    NoConsensus(usize),
    #[error("degenerate configuration")]
    Degenerate,
}

/// A 2D measurement paired with its reconstructed 3D point.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence2D3D {
    pub pixel: Vector2<f64>,
    pub point: Vector3<f64>,
}
