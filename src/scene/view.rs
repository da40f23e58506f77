//! A view: one input image and its references into the shared stores.

use serde::{Deserialize, Serialize};

use super::types::{IntrinsicId, PoseId, ViewId};

/// One input image.
///
/// A view only holds references (ids) into the intrinsic and pose stores;
/// whether the view is reconstructed is determined by the presence of its
/// pose in the scene, not by a flag here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    /// Shared camera intrinsic, if calibration is known for this view.
    pub intrinsic_id: Option<IntrinsicId>,
    /// Pose slot this view reads from once reconstructed.
    pub pose_id: PoseId,
    pub width: u32,
    pub height: u32,
}

impl View {
    /// Create a view whose pose id mirrors its view id, the common case
    /// for single-camera-per-image datasets.
    pub fn new(id: ViewId, intrinsic_id: Option<IntrinsicId>, width: u32, height: u32) -> Self {
        Self {
            id,
            intrinsic_id,
            pose_id: PoseId(id.0),
            width,
            height,
        }
    }
}
