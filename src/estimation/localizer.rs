//! Camera localization (resection) from 2D-3D correspondences.
//!
//! The default localizer runs a 6-point projective DLT inside RANSAC.
//! On the calibrated path the known calibration strips K off the fitted
//! projection matrix; on the uncalibrated path the matrix is decomposed
//! by RQ factorization so the caller can derive an intrinsic from it.

use nalgebra::{DMatrix, Matrix3, Matrix4, SMatrix, Vector2, Vector3, Vector4};

use crate::geometry::Pose;

use super::ransac::{ransac, Estimator, RansacOptions};
use super::relative_pose::normalize_2d;
use super::{Correspondence2D3D, EstimationError};

/// Result of a 2D-3D localization.
#[derive(Debug, Clone)]
pub struct Localization {
    pub pose: Pose,
    /// Calibration matrix: the input K on the calibrated path, the one
    /// recovered from the projection matrix otherwise.
    pub k: Matrix3<f64>,
    pub inliers: Vec<usize>,
    /// Inlier threshold in pixels (largest inlier residual).
    pub threshold_px: f64,
}

/// Robust pose-from-2D/3D estimation.
pub trait Localizer: Send + Sync {
    /// `k` carries the view's calibration when one is known; pixels are
    /// expected to be undistorted in that case.
    fn localize(
        &self,
        data: &[Correspondence2D3D],
        k: Option<&Matrix3<f64>>,
    ) -> Result<Localization, EstimationError>;
}

/// Projective DLT resection inside RANSAC.
#[derive(Debug, Clone, Default)]
pub struct PnpRansac {
    /// RANSAC options; the threshold is interpreted in pixels.
    pub options: RansacOptions,
}

impl PnpRansac {
    pub fn new(options: RansacOptions) -> Self {
        Self { options }
    }
}

struct DltResection;

impl Estimator for DltResection {
    type Datum = Correspondence2D3D;
    type Model = SMatrix<f64, 3, 4>;
    const MIN_SAMPLES: usize = 6;

    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
        fit_projection(data, sample)
    }

    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64 {
        let ph = model * Vector4::new(datum.point.x, datum.point.y, datum.point.z, 1.0);
        if ph.z <= 1e-12 {
            return f64::MAX;
        }
        (Vector2::new(ph.x / ph.z, ph.y / ph.z) - datum.pixel).norm()
    }

    fn refit(&self, data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        fit_projection(data, inliers)
    }
}

impl Localizer for PnpRansac {
    fn localize(
        &self,
        data: &[Correspondence2D3D],
        k: Option<&Matrix3<f64>>,
    ) -> Result<Localization, EstimationError> {
        if data.len() < DltResection::MIN_SAMPLES {
            return Err(EstimationError::NotEnoughData {
                found: data.len(),
                needed: DltResection::MIN_SAMPLES,
            });
        }

        let result = ransac(&DltResection, data, &self.options)
            .ok_or(EstimationError::NoConsensus(self.options.max_iterations))?;

        let (pose, k) = match k {
            Some(k) => (decompose_calibrated(&result.model, k)?, *k),
            None => decompose_projective(&result.model)?,
        };

        let threshold_px = result
            .inliers
            .iter()
            .map(|&i| DltResection.residual(&result.model, &data[i]))
            .fold(0.0f64, f64::max);

        Ok(Localization {
            pose,
            k,
            inliers: result.inliers,
            threshold_px,
        })
    }
}

/// Fit a 3x4 projection matrix by DLT with Hartley normalization of both
/// the 2D and 3D point sets, sign-fixed so sampled depths are positive.
fn fit_projection(
    data: &[Correspondence2D3D],
    indices: &[usize],
) -> Option<SMatrix<f64, 3, 4>> {
    if indices.len() < 6 {
        return None;
    }
    let pixels: Vec<Vector2<f64>> = indices.iter().map(|&i| data[i].pixel).collect();
    let points: Vec<Vector3<f64>> = indices.iter().map(|&i| data[i].point).collect();
    let (n2d, t2d) = normalize_2d(&pixels);
    let (n3d, t3d) = normalize_3d(&points);

    let mut a = DMatrix::<f64>::zeros(2 * indices.len(), 12);
    for (row, (x, p)) in n2d.iter().zip(&n3d).enumerate() {
        let ph = [p.x, p.y, p.z, 1.0];
        for c in 0..4 {
            a[(2 * row, c)] = ph[c];
            a[(2 * row, 8 + c)] = -x.x * ph[c];
            a[(2 * row + 1, 4 + c)] = ph[c];
            a[(2 * row + 1, 8 + c)] = -x.y * ph[c];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let p = v_t.row(v_t.nrows() - 1);
    let mut p_norm = SMatrix::<f64, 3, 4>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            p_norm[(r, c)] = p[4 * r + c];
        }
    }

    let mut proj = t2d.try_inverse()? * p_norm * t3d;

    // Resolve the projective sign so the sampled points sit in front.
    let positive = points
        .iter()
        .filter(|p| (proj * Vector4::new(p.x, p.y, p.z, 1.0)).z > 0.0)
        .count();
    if positive * 2 < points.len() {
        proj = -proj;
    }
    Some(proj)
}

/// Hartley-style normalization for 3D points: centroid to the origin,
/// mean distance sqrt(3). Returns the 4x4 homogeneous transform.
fn normalize_3d(points: &[Vector3<f64>]) -> (Vec<Vector3<f64>>, Matrix4<f64>) {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector3<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 1e-12 {
        3.0f64.sqrt() / mean_dist
    } else {
        1.0
    };
    let transformed = points.iter().map(|p| (p - centroid) * scale).collect();
    let mut t = Matrix4::identity();
    t[(0, 0)] = scale;
    t[(1, 1)] = scale;
    t[(2, 2)] = scale;
    t[(0, 3)] = -scale * centroid.x;
    t[(1, 3)] = -scale * centroid.y;
    t[(2, 3)] = -scale * centroid.z;
    (transformed, t)
}

/// Strip a known K off the projection matrix and orthonormalize.
fn decompose_calibrated(
    proj: &SMatrix<f64, 3, 4>,
    k: &Matrix3<f64>,
) -> Result<Pose, EstimationError> {
    let k_inv = k.try_inverse().ok_or(EstimationError::Degenerate)?;
    let rt = k_inv * proj;
    let m: Matrix3<f64> = rt.fixed_view::<3, 3>(0, 0).into_owned();

    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(EstimationError::Degenerate),
    };
    let mut r = u * v_t;
    let mut scale = svd.singular_values.mean();
    if scale < 1e-12 {
        return Err(EstimationError::Degenerate);
    }
    if r.determinant() < 0.0 {
        r = -r;
        scale = -scale;
    }
    let t = Vector3::new(rt[(0, 3)], rt[(1, 3)], rt[(2, 3)]) / scale;
    Ok(Pose::from_rt(r, t))
}

/// Full K/R/t decomposition of an uncalibrated projection matrix.
fn decompose_projective(
    proj: &SMatrix<f64, 3, 4>,
) -> Result<(Pose, Matrix3<f64>), EstimationError> {
    let m: Matrix3<f64> = proj.fixed_view::<3, 3>(0, 0).into_owned();
    let (mut k, mut r) = rq3(&m);

    // Force a positive-diagonal K; the sign matrix is its own inverse.
    let d = Matrix3::from_diagonal(&Vector3::new(
        k[(0, 0)].signum(),
        k[(1, 1)].signum(),
        k[(2, 2)].signum(),
    ));
    k *= d;
    r = d * r;

    let s = k[(2, 2)];
    if s.abs() < 1e-12 {
        return Err(EstimationError::Degenerate);
    }
    k /= s;
    let k_inv = k.try_inverse().ok_or(EstimationError::Degenerate)?;
    let p3 = Vector3::new(proj[(0, 3)], proj[(1, 3)], proj[(2, 3)]);
    let mut t = k_inv * (p3 / s);
    if r.determinant() < 0.0 {
        r = -r;
        t = -t;
    }
    Ok((Pose::from_rt(r, t), k))
}

/// RQ factorization of a 3x3 matrix via QR of the flipped transpose.
fn rq3(m: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let flip = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let qr = (flip * m).transpose().qr();
    let q_tilde = qr.q();
    let r_tilde = qr.r();
    let r_upper = flip * r_tilde.transpose() * flip;
    let q = flip * q_tilde.transpose();
    (r_upper, q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn k() -> Matrix3<f64> {
        Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn scene_pose() -> Pose {
        Pose::from_rt(
            *Rotation3::from_euler_angles(0.05, 0.2, -0.1).matrix(),
            Vector3::new(0.3, -0.2, 0.5),
        )
    }

    fn correspondences(pose: &Pose, k: &Matrix3<f64>) -> Vec<Correspondence2D3D> {
        let mut data = Vec::new();
        for i in 0..7 {
            for j in 0..7 {
                let point = Vector3::new(
                    (i as f64 - 3.0) * 0.4,
                    (j as f64 - 3.0) * 0.4,
                    5.0 + ((i * 5 + j) % 4) as f64 * 0.5,
                );
                let pc = pose.transform_point(&point);
                let pixel = Vector2::new(
                    k[(0, 0)] * pc.x / pc.z + k[(0, 2)],
                    k[(1, 1)] * pc.y / pc.z + k[(1, 2)],
                );
                data.push(Correspondence2D3D { pixel, point });
            }
        }
        data
    }

    #[test]
    fn test_calibrated_localization() {
        let pose = scene_pose();
        let data = correspondences(&pose, &k());
        let localizer = PnpRansac::new(RansacOptions {
            threshold: 2.0,
            ..Default::default()
        });

        let loc = localizer.localize(&data, Some(&k())).unwrap();
        assert_eq!(loc.inliers.len(), data.len());
        assert_relative_eq!(loc.pose.translation, pose.translation, epsilon = 1e-5);
        assert_relative_eq!(
            loc.pose.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_uncalibrated_localization_recovers_focal() {
        let pose = scene_pose();
        let data = correspondences(&pose, &k());
        let localizer = PnpRansac::new(RansacOptions {
            threshold: 2.0,
            ..Default::default()
        });

        let loc = localizer.localize(&data, None).unwrap();
        let focal = (loc.k[(0, 0)] + loc.k[(1, 1)]) / 2.0;
        assert_relative_eq!(focal, 600.0, epsilon = 1.0);
        assert_relative_eq!(loc.k[(0, 2)], 320.0, epsilon = 1.0);
        assert_relative_eq!(
            loc.pose.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_outliers_are_excluded() {
        let pose = scene_pose();
        let mut data = correspondences(&pose, &k());
        let total = data.len();
        for (n, c) in data.iter_mut().enumerate().filter(|(n, _)| n % 6 == 0) {
            c.pixel.y -= 60.0 + n as f64;
        }

        let localizer = PnpRansac::new(RansacOptions {
            threshold: 2.0,
            ..Default::default()
        });
        let loc = localizer.localize(&data, Some(&k())).unwrap();
        assert!(loc.inliers.len() >= total / 2);
        assert!(loc.inliers.iter().all(|&i| i % 6 != 0));
        assert!(loc.threshold_px < 2.0);
    }

    #[test]
    fn test_not_enough_data() {
        let localizer = PnpRansac::default();
        let err = localizer.localize(&[], Some(&k())).unwrap_err();
        assert!(matches!(err, EstimationError::NotEnoughData { .. }));
    }
}
