//! Geometry primitives: SE(3) camera poses and two-view triangulation.

pub mod pose;
pub mod triangulation;

pub use pose::Pose;
pub use triangulation::{projection_matrix, ray_angle_degrees, triangulate_dlt};
