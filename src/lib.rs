//! Incremental Structure-from-Motion.
//!
//! Given per-view feature points and pairwise feature matches, the
//! [`engine::ReconstructionEngine`] grows a calibrated sparse scene:
//! it keeps the largest 2-edge-connected component of the view graph,
//! chains matches into tracks, bootstraps from an automatically chosen
//! view pair, then resects the remaining views one batch at a time
//! while bundle adjustment and outlier rejection keep the structure
//! clean.
//!
//! The estimation building blocks (RANSAC, essential-matrix relative
//! pose, DLT resection, Levenberg-Marquardt bundle adjustment) are
//! public and usable on their own, and the engine accepts replacements
//! for each of them through its builder methods.

pub mod ba;
pub mod camera;
pub mod engine;
pub mod estimation;
pub mod geometry;
pub mod graph;
pub mod scene;
pub mod tracks;

pub use ba::{BaOptions, BundleAdjuster, IntrinsicPolicy, LmBundleAdjuster};
pub use camera::Intrinsic;
pub use engine::{EngineConfig, EngineState, ReconstructionEngine};
pub use geometry::Pose;
pub use scene::{IntrinsicId, Landmark, PoseId, Scene, TrackId, View, ViewId};
pub use tracks::{FeaturesProvider, MatchesProvider, Pair, PairwiseMatches};
