//! The scene model: views, intrinsics, poses and landmarks.

pub mod landmark;
#[allow(clippy::module_inception)]
pub mod scene;
pub mod types;
pub mod view;

pub use landmark::{Landmark, Observation};
pub use scene::{ResidualStats, Scene};
pub use types::{IntrinsicId, PoseId, TrackId, ViewId};
pub use view::View;
