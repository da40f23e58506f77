//! Camera extrinsic: a rigid transform mapping world coordinates into the
//! camera frame (`x_cam = R * x_world + t`).

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// World-to-camera rigid transform in SE(3).
///
/// Stored as a unit quaternion plus translation to keep composition and
/// inversion cheap and drift-free under repeated refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    /// Identity transform (camera at the world origin, axis-aligned).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        *self.rotation.to_rotation_matrix().matrix()
    }

    /// Camera center in world coordinates (`-R^T t`).
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Inverse transform (camera-to-world).
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let t_inv = -(rot_inv * self.translation);
        Self {
            rotation: rot_inv,
            translation: t_inv,
        }
    }

    /// Compose two transforms (`self` applied after `other`).
    pub fn compose(&self, other: &Pose) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Map a world point into the camera frame.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Depth of a world point along the camera's optical axis.
    pub fn depth(&self, p: &Vector3<f64>) -> f64 {
        self.transform_point(p).z
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}
