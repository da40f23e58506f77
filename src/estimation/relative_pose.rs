//! Two-view relative pose by essential-matrix RANSAC.
//!
//! The default estimator normalizes pixels by the calibration matrices,
//! fits an essential matrix with the 8-point algorithm (Hartley
//! normalization, rank-2 / equal-singular-value enforcement), scores by
//! Sampson distance, and recovers the relative pose by cheirality vote
//! over the four decompositions.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use crate::geometry::{triangulate_dlt, Pose};

use super::ransac::{ransac, Estimator, RansacOptions};
use super::EstimationError;

/// Result of a two-view relative-pose estimation.
#[derive(Debug, Clone)]
pub struct RelativePose {
    /// Pose of the second view, with the first view at identity.
    pub pose: Pose,
    /// Indices into the input correspondence arrays.
    pub inliers: Vec<usize>,
    /// Residual precision in pixels (largest inlier residual).
    pub precision_px: f64,
}

/// Robust relative-pose estimation from pixel correspondences.
pub trait TwoViewEstimator: Send + Sync {
    fn estimate(
        &self,
        x1: &[Vector2<f64>],
        x2: &[Vector2<f64>],
        k1: &Matrix3<f64>,
        k2: &Matrix3<f64>,
    ) -> Result<RelativePose, EstimationError>;
}

/// Essential-matrix RANSAC with an 8-point minimal solver.
#[derive(Debug, Clone, Default)]
pub struct EssentialRansac {
    /// RANSAC options; the threshold is interpreted in pixels.
    pub options: RansacOptions,
}

impl EssentialRansac {
    pub fn new(options: RansacOptions) -> Self {
        Self { options }
    }
}

struct EightPoint;

impl Estimator for EightPoint {
    type Datum = (Vector2<f64>, Vector2<f64>);
    type Model = Matrix3<f64>;
    const MIN_SAMPLES: usize = 8;

    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Matrix3<f64>> {
        fit_essential(data, sample)
    }

    fn residual(&self, model: &Matrix3<f64>, datum: &Self::Datum) -> f64 {
        sampson_distance(model, &datum.0, &datum.1)
    }

    fn refit(&self, data: &[Self::Datum], inliers: &[usize]) -> Option<Matrix3<f64>> {
        fit_essential(data, inliers)
    }
}

impl TwoViewEstimator for EssentialRansac {
    fn estimate(
        &self,
        x1: &[Vector2<f64>],
        x2: &[Vector2<f64>],
        k1: &Matrix3<f64>,
        k2: &Matrix3<f64>,
    ) -> Result<RelativePose, EstimationError> {
        if x1.len() != x2.len() || x1.len() < EightPoint::MIN_SAMPLES {
            return Err(EstimationError::NotEnoughData {
                found: x1.len().min(x2.len()),
                needed: EightPoint::MIN_SAMPLES,
            });
        }

        let data: Vec<(Vector2<f64>, Vector2<f64>)> = x1
            .iter()
            .zip(x2)
            .map(|(a, b)| (pixel_to_norm(a, k1), pixel_to_norm(b, k2)))
            .collect();

        // Sampson distances live in normalized coordinates; scale the
        // pixel threshold down by the mean focal length.
        let focal = (k1[(0, 0)] + k1[(1, 1)] + k2[(0, 0)] + k2[(1, 1)]) / 4.0;
        let mut options = self.options.clone();
        options.threshold = self.options.threshold / focal;

        let result = ransac(&EightPoint, &data, &options)
            .ok_or(EstimationError::NoConsensus(self.options.max_iterations))?;

        let pose = recover_pose(&result.model, &data, &result.inliers)
            .ok_or(EstimationError::Degenerate)?;

        let precision_px = result
            .inliers
            .iter()
            .map(|&i| sampson_distance(&result.model, &data[i].0, &data[i].1) * focal)
            .fold(0.0f64, f64::max);

        Ok(RelativePose {
            pose,
            inliers: result.inliers,
            precision_px,
        })
    }
}

fn pixel_to_norm(px: &Vector2<f64>, k: &Matrix3<f64>) -> Vector2<f64> {
    Vector2::new(
        (px.x - k[(0, 2)]) / k[(0, 0)],
        (px.y - k[(1, 2)]) / k[(1, 1)],
    )
}

/// Hartley normalization: translate to the centroid and scale so the
/// mean distance from it is sqrt(2).
pub(crate) fn normalize_2d(points: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let transformed = points.iter().map(|p| (p - centroid) * scale).collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    (transformed, t)
}

fn fit_essential(
    data: &[(Vector2<f64>, Vector2<f64>)],
    indices: &[usize],
) -> Option<Matrix3<f64>> {
    if indices.len() < 8 {
        return None;
    }
    let p1: Vec<Vector2<f64>> = indices.iter().map(|&i| data[i].0).collect();
    let p2: Vec<Vector2<f64>> = indices.iter().map(|&i| data[i].1).collect();
    let (n1, t1) = normalize_2d(&p1);
    let (n2, t2) = normalize_2d(&p2);

    // Each correspondence constrains x2^T E x1 = 0. Pad to at least 9
    // rows so nalgebra's thin SVD spans the full right-singular basis
    // and the null vector is present in `v_t`; zero rows add no
    // constraints.
    let mut a = DMatrix::<f64>::zeros(indices.len().max(9), 9);
    for (row, (x1, x2)) in n1.iter().zip(&n2).enumerate() {
        a[(row, 0)] = x2.x * x1.x;
        a[(row, 1)] = x2.x * x1.y;
        a[(row, 2)] = x2.x;
        a[(row, 3)] = x2.y * x1.x;
        a[(row, 4)] = x2.y * x1.y;
        a[(row, 5)] = x2.y;
        a[(row, 6)] = x1.x;
        a[(row, 7)] = x1.y;
        a[(row, 8)] = 1.0;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let e = v_t.row(v_t.nrows() - 1);
    let e_norm = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);

    let e_raw = t2.transpose() * e_norm * t1;
    Some(enforce_essential_constraints(&e_raw)?)
}

/// Project onto the essential manifold: singular values (s, s, 0) with
/// s the mean of the two largest.
fn enforce_essential_constraints(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
    let sigma = Matrix3::from_diagonal(&Vector3::new(s, s, 0.0));
    Some(u * sigma * v_t)
}

fn sampson_distance(e: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let p1 = Vector3::new(x1.x, x1.y, 1.0);
    let p2 = Vector3::new(x2.x, x2.y, 1.0);
    let ex1 = e * p1;
    let etx2 = e.transpose() * p2;
    let num = p2.dot(&ex1);
    let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if denom < 1e-15 {
        return f64::MAX;
    }
    (num * num / denom).sqrt()
}

/// Four (R, t) decompositions of an essential matrix, disambiguated by
/// counting positive-depth triangulations over the inlier set.
fn recover_pose(
    e: &Matrix3<f64>,
    data: &[(Vector2<f64>, Vector2<f64>)],
    inliers: &[usize],
) -> Option<Pose> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t: Vector3<f64> = u.column(2).into_owned();

    let identity = Pose::identity();
    let mut best: Option<(usize, Pose)> = None;
    for (r, t) in [(r1, t), (r1, -t), (r2, t), (r2, -t)] {
        let candidate = Pose::from_rt(r, t);
        let votes = inliers
            .iter()
            .filter(|&&i| {
                let (x1, x2) = data[i];
                triangulate_dlt(&x1, &x2, &identity, &candidate).map_or(false, |p| {
                    identity.depth(&p) > 0.0 && candidate.depth(&p) > 0.0
                })
            })
            .count();
        if best.as_ref().map_or(true, |(b, _)| votes > *b) {
            best = Some((votes, candidate));
        }
    }
    match best {
        Some((votes, pose)) if votes > 0 => Some(pose),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn k() -> Matrix3<f64> {
        Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(pose: &Pose, p: &Vector3<f64>, k: &Matrix3<f64>) -> Vector2<f64> {
        let pc = pose.transform_point(p);
        Vector2::new(
            k[(0, 0)] * pc.x / pc.z + k[(0, 2)],
            k[(1, 1)] * pc.y / pc.z + k[(1, 2)],
        )
    }

    fn synthetic_points() -> Vec<Vector3<f64>> {
        // Non-planar grid in front of both cameras.
        let mut points = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                points.push(Vector3::new(
                    (i as f64 - 3.5) * 0.3,
                    (j as f64 - 3.5) * 0.3,
                    4.0 + ((i * 3 + j) % 5) as f64 * 0.4,
                ));
            }
        }
        points
    }

    #[test]
    fn test_recovers_known_relative_pose() {
        let pose1 = Pose::identity();
        let r = *Rotation3::from_euler_angles(0.02, -0.1, 0.03).matrix();
        let t = Vector3::new(-0.8, 0.1, 0.05);
        let pose2 = Pose::from_rt(r, t);

        let points = synthetic_points();
        let x1: Vec<Vector2<f64>> = points.iter().map(|p| project(&pose1, p, &k())).collect();
        let x2: Vec<Vector2<f64>> = points.iter().map(|p| project(&pose2, p, &k())).collect();

        let estimator = EssentialRansac::new(RansacOptions {
            threshold: 4.0,
            ..Default::default()
        });
        let result = estimator.estimate(&x1, &x2, &k(), &k()).unwrap();

        assert_eq!(result.inliers.len(), points.len());
        // Translation is recovered up to scale.
        let t_est = result.pose.translation.normalize();
        assert_relative_eq!(t_est, t.normalize(), epsilon = 1e-4);
        let r_est = result.pose.rotation_matrix();
        assert_relative_eq!(r_est, r, epsilon = 1e-4);
        assert!(result.precision_px < 1.0);
    }

    #[test]
    fn test_rejects_gross_outliers() {
        let pose1 = Pose::identity();
        let pose2 = Pose::from_rt(Matrix3::identity(), Vector3::new(-1.0, 0.0, 0.0));
        let points = synthetic_points();
        let x1: Vec<Vector2<f64>> = points.iter().map(|p| project(&pose1, p, &k())).collect();
        let mut x2: Vec<Vector2<f64>> = points.iter().map(|p| project(&pose2, p, &k())).collect();
        // Corrupt a fifth of the correspondences, perpendicular to the
        // horizontal epipolar lines of this pure-x baseline so the
        // corruption is actually visible to the epipolar error.
        for (n, px) in x2.iter_mut().enumerate().filter(|(n, _)| n % 5 == 0) {
            px.y += 40.0 + n as f64;
        }

        let estimator = EssentialRansac::new(RansacOptions {
            threshold: 2.0,
            ..Default::default()
        });
        let result = estimator.estimate(&x1, &x2, &k(), &k()).unwrap();
        assert!(result.inliers.len() >= points.len() / 2);
        assert!(result.inliers.iter().all(|&i| i % 5 != 0));
    }

    #[test]
    fn test_too_few_points() {
        let estimator = EssentialRansac::default();
        let err = estimator
            .estimate(&[], &[], &k(), &k())
            .unwrap_err();
        assert!(matches!(err, EstimationError::NotEnoughData { .. }));
    }
}
