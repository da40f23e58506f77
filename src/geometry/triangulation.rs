//! Direct linear triangulation and the geometric checks applied to
//! candidate 3D points (parallax angle, positive depth).

use nalgebra::{Matrix4, SMatrix, Vector2, Vector3};

use super::Pose;

/// Build a 3x4 normalized projection matrix `[R | t]` from a
/// world-to-camera pose.
pub fn projection_matrix(pose: &Pose) -> SMatrix<f64, 3, 4> {
    let r = pose.rotation_matrix();
    let mut p = SMatrix::<f64, 3, 4>::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&pose.translation);
    p
}

/// Triangulate a 3D point from two normalized image observations via DLT.
///
/// `xn1`/`xn2` are undistorted normalized coordinates (z = 1 plane).
/// Each observation contributes two rows of the homogeneous system
/// `A * X = 0` (`x * P[2] - P[0]` and `y * P[2] - P[1]`); the solution is
/// the right singular vector of the smallest singular value.
///
/// Returns `None` when the point is at infinity or the SVD fails.
pub fn triangulate_dlt(
    xn1: &Vector2<f64>,
    xn2: &Vector2<f64>,
    pose1: &Pose,
    pose2: &Pose,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(pose1);
    let p2 = projection_matrix(pose2);

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(true, true);
    let v = svd.v_t?.transpose();
    let h = v.column(3);
    if h[3].abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// Angle in degrees between the rays from two camera centers to a world
/// point. Returns 0 when either ray is degenerate.
pub fn ray_angle_degrees(c1: &Vector3<f64>, c2: &Vector3<f64>, point: &Vector3<f64>) -> f64 {
    let r1 = point - c1;
    let r2 = point - c2;
    let n1 = r1.norm();
    let n2 = r2.norm();
    if n1 < 1e-12 || n2 < 1e-12 {
        return 0.0;
    }
    let cos = (r1.dot(&r2) / (n1 * n2)).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    #[test]
    fn test_triangulate_recovers_point() {
        let pose1 = Pose::identity();
        // Second camera translated one unit along x.
        let pose2 = Pose::from_rt(Matrix3::identity(), Vector3::new(-1.0, 0.0, 0.0));

        let p_world = Vector3::new(0.2, -0.1, 5.0);
        let pc1 = pose1.transform_point(&p_world);
        let pc2 = pose2.transform_point(&p_world);
        let xn1 = Vector2::new(pc1.x / pc1.z, pc1.y / pc1.z);
        let xn2 = Vector2::new(pc2.x / pc2.z, pc2.y / pc2.z);

        let x = triangulate_dlt(&xn1, &xn2, &pose1, &pose2).unwrap();
        assert_relative_eq!(x, p_world, epsilon = 1e-8);
    }

    #[test]
    fn test_zero_baseline_is_degenerate() {
        let pose = Pose::identity();
        let xn = Vector2::new(0.1, 0.1);
        // Identical cameras give a rank-deficient system; either no
        // solution or an arbitrary one along the ray.
        if let Some(x) = triangulate_dlt(&xn, &xn, &pose, &pose) {
            let angle = ray_angle_degrees(&pose.center(), &pose.center(), &x);
            assert_relative_eq!(angle, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_ray_angle() {
        let c1 = Vector3::new(-1.0, 0.0, 0.0);
        let c2 = Vector3::new(1.0, 0.0, 0.0);
        let p = Vector3::new(0.0, 0.0, 1.0);
        // Symmetric configuration, 45 degrees each side of vertical.
        assert_relative_eq!(ray_angle_degrees(&c1, &c2, &p), 90.0, epsilon = 1e-9);
    }
}
