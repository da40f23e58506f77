//! Camera intrinsic models.
//!
//! A closed set of five models sharing one capability surface: project a
//! camera-frame point to a pixel, undistort a pixel back to the ideal
//! pinhole image, report whether the model distorts at all, and expose
//! the parameter count. The reconstruction engine only ever talks to
//! [`Intrinsic`]; the concrete model is chosen by the caller per view.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Fixed-point iterations used to invert the polynomial distortions.
const UNDISTORT_ITERATIONS: usize = 10;

/// Ideal pinhole parameters shared by every model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pinhole {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Pinhole {
    pub fn new(focal: f64, cx: f64, cy: f64) -> Self {
        Self { focal, cx, cy }
    }

    /// Normalized (z = 1) coordinates to pixel.
    fn cam_to_pixel(&self, xn: Vector2<f64>) -> Vector2<f64> {
        Vector2::new(self.focal * xn.x + self.cx, self.focal * xn.y + self.cy)
    }

    /// Pixel to normalized coordinates, ignoring distortion.
    fn pixel_to_cam(&self, px: Vector2<f64>) -> Vector2<f64> {
        Vector2::new((px.x - self.cx) / self.focal, (px.y - self.cy) / self.focal)
    }
}

/// Camera model with one radial distortion coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadialK1 {
    pub pinhole: Pinhole,
    pub k1: f64,
}

/// Camera model with three radial distortion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadialK3 {
    pub pinhole: Pinhole,
    pub k: [f64; 3],
}

/// Brown-Conrady model: three radial plus two tangential coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady {
    pub pinhole: Pinhole,
    pub k: [f64; 3],
    pub p: [f64; 2],
}

/// Equidistant fisheye model with a fourth-order theta polynomial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fisheye {
    pub pinhole: Pinhole,
    pub k: [f64; 4],
}

/// Polymorphic camera intrinsic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intrinsic {
    Pinhole(Pinhole),
    RadialK1(RadialK1),
    RadialK3(RadialK3),
    BrownConrady(BrownConrady),
    Fisheye(Fisheye),
}

impl Intrinsic {
    /// Ideal pinhole parameters underlying this model.
    pub fn pinhole(&self) -> &Pinhole {
        match self {
            Intrinsic::Pinhole(p) => p,
            Intrinsic::RadialK1(m) => &m.pinhole,
            Intrinsic::RadialK3(m) => &m.pinhole,
            Intrinsic::BrownConrady(m) => &m.pinhole,
            Intrinsic::Fisheye(m) => &m.pinhole,
        }
    }

    pub fn focal(&self) -> f64 {
        self.pinhole().focal
    }

    /// Calibration matrix of the underlying pinhole.
    pub fn k(&self) -> Matrix3<f64> {
        let p = self.pinhole();
        Matrix3::new(p.focal, 0.0, p.cx, 0.0, p.focal, p.cy, 0.0, 0.0, 1.0)
    }

    pub fn has_distortion(&self) -> bool {
        !matches!(self, Intrinsic::Pinhole(_))
    }

    pub fn param_count(&self) -> usize {
        match self {
            Intrinsic::Pinhole(_) => 3,
            Intrinsic::RadialK1(_) => 4,
            Intrinsic::RadialK3(_) => 6,
            Intrinsic::BrownConrady(_) => 8,
            Intrinsic::Fisheye(_) => 7,
        }
    }

    /// Project a camera-frame point to a (distorted) pixel.
    ///
    /// Points at or behind the image plane project through `z` unchanged;
    /// callers are expected to reject non-positive depths separately.
    pub fn project(&self, x_cam: &Vector3<f64>) -> Vector2<f64> {
        let xn = Vector2::new(x_cam.x / x_cam.z, x_cam.y / x_cam.z);
        self.pinhole().cam_to_pixel(self.distort(xn))
    }

    /// Map a pixel to its ideal (undistorted) position.
    pub fn undistort_pixel(&self, px: Vector2<f64>) -> Vector2<f64> {
        let p = self.pinhole();
        p.cam_to_pixel(self.undistort_norm(p.pixel_to_cam(px)))
    }

    /// Bearing of a pixel in the camera frame (z = 1 plane).
    pub fn bearing(&self, px: Vector2<f64>) -> Vector2<f64> {
        self.undistort_norm(self.pinhole().pixel_to_cam(px))
    }

    /// Apply the model's distortion to normalized coordinates.
    fn distort(&self, xn: Vector2<f64>) -> Vector2<f64> {
        match self {
            Intrinsic::Pinhole(_) => xn,
            Intrinsic::RadialK1(m) => {
                let r2 = xn.norm_squared();
                xn * (1.0 + m.k1 * r2)
            }
            Intrinsic::RadialK3(m) => xn * radial_factor(&m.k, xn.norm_squared()),
            Intrinsic::BrownConrady(m) => {
                let r2 = xn.norm_squared();
                xn * radial_factor(&m.k, r2) + tangential(&m.p, xn, r2)
            }
            Intrinsic::Fisheye(m) => {
                let r = xn.norm();
                if r < 1e-12 {
                    return xn;
                }
                let theta = r.atan();
                xn * (theta_poly(&m.k, theta) / r)
            }
        }
    }

    /// Invert the distortion by fixed-point iteration.
    ///
    /// The polynomial models iterate `x <- (xd - tangential(x)) / radial(x)`;
    /// the fisheye model solves the theta polynomial the same way. Both
    /// converge in a handful of iterations for physically plausible
    /// coefficients.
    fn undistort_norm(&self, xd: Vector2<f64>) -> Vector2<f64> {
        match self {
            Intrinsic::Pinhole(_) => xd,
            Intrinsic::RadialK1(m) => {
                let mut x = xd;
                for _ in 0..UNDISTORT_ITERATIONS {
                    x = xd / (1.0 + m.k1 * x.norm_squared());
                }
                x
            }
            Intrinsic::RadialK3(m) => {
                let mut x = xd;
                for _ in 0..UNDISTORT_ITERATIONS {
                    x = xd / radial_factor(&m.k, x.norm_squared());
                }
                x
            }
            Intrinsic::BrownConrady(m) => {
                let mut x = xd;
                for _ in 0..UNDISTORT_ITERATIONS {
                    let r2 = x.norm_squared();
                    x = (xd - tangential(&m.p, x, r2)) / radial_factor(&m.k, r2);
                }
                x
            }
            Intrinsic::Fisheye(m) => {
                let theta_d = xd.norm();
                if theta_d < 1e-12 {
                    return xd;
                }
                let mut theta = theta_d;
                for _ in 0..UNDISTORT_ITERATIONS {
                    theta = theta_d / (theta_poly(&m.k, theta) / theta.max(1e-12));
                }
                xd * (theta.tan() / theta_d)
            }
        }
    }
}

fn radial_factor(k: &[f64; 3], r2: f64) -> f64 {
    1.0 + r2 * (k[0] + r2 * (k[1] + r2 * k[2]))
}

fn tangential(p: &[f64; 2], xn: Vector2<f64>, r2: f64) -> Vector2<f64> {
    Vector2::new(
        2.0 * p[0] * xn.x * xn.y + p[1] * (r2 + 2.0 * xn.x * xn.x),
        p[0] * (r2 + 2.0 * xn.y * xn.y) + 2.0 * p[1] * xn.x * xn.y,
    )
}

fn theta_poly(k: &[f64; 4], theta: f64) -> f64 {
    let t2 = theta * theta;
    theta * (1.0 + t2 * (k[0] + t2 * (k[1] + t2 * (k[2] + t2 * k[3]))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pinhole() -> Pinhole {
        Pinhole::new(800.0, 320.0, 240.0)
    }

    #[test]
    fn test_pinhole_project_unproject() {
        let cam = Intrinsic::Pinhole(pinhole());
        let px = cam.project(&Vector3::new(0.1, -0.2, 2.0));
        assert_relative_eq!(px, Vector2::new(360.0, 160.0), epsilon = 1e-12);
        let xn = cam.bearing(px);
        assert_relative_eq!(xn, Vector2::new(0.05, -0.1), epsilon = 1e-12);
        assert!(!cam.has_distortion());
    }

    #[test]
    fn test_radial_undistort_inverts_distort() {
        let cam = Intrinsic::RadialK3(RadialK3 {
            pinhole: pinhole(),
            k: [-0.2, 0.05, -0.001],
        });
        let xn = Vector2::new(0.2, -0.15);
        let back = cam.undistort_norm(cam.distort(xn));
        assert_relative_eq!(back, xn, epsilon = 1e-9);
        assert!(cam.has_distortion());
    }

    #[test]
    fn test_brown_undistort_inverts_distort() {
        let cam = Intrinsic::BrownConrady(BrownConrady {
            pinhole: pinhole(),
            k: [-0.1, 0.02, 0.0],
            p: [0.001, -0.0005],
        });
        let xn = Vector2::new(-0.25, 0.1);
        let back = cam.undistort_norm(cam.distort(xn));
        assert_relative_eq!(back, xn, epsilon = 1e-8);
    }

    #[test]
    fn test_fisheye_undistort_inverts_distort() {
        let cam = Intrinsic::Fisheye(Fisheye {
            pinhole: pinhole(),
            k: [0.01, -0.002, 0.0, 0.0],
        });
        let xn = Vector2::new(0.3, 0.2);
        let back = cam.undistort_norm(cam.distort(xn));
        assert_relative_eq!(back, xn, epsilon = 1e-8);
    }

    #[test]
    fn test_param_count() {
        let p = pinhole();
        assert_eq!(Intrinsic::Pinhole(p).param_count(), 3);
        assert_eq!(
            Intrinsic::RadialK1(RadialK1 { pinhole: p, k1: 0.0 }).param_count(),
            4
        );
        assert_eq!(
            Intrinsic::RadialK3(RadialK3 { pinhole: p, k: [0.0; 3] }).param_count(),
            6
        );
        assert_eq!(
            Intrinsic::BrownConrady(BrownConrady { pinhole: p, k: [0.0; 3], p: [0.0; 2] })
                .param_count(),
            8
        );
        assert_eq!(
            Intrinsic::Fisheye(Fisheye { pinhole: p, k: [0.0; 4] }).param_count(),
            7
        );
    }

    #[test]
    fn test_k_matrix() {
        let cam = Intrinsic::Pinhole(pinhole());
        let k = cam.k();
        assert_relative_eq!(k[(0, 0)], 800.0);
        assert_relative_eq!(k[(1, 1)], 800.0);
        assert_relative_eq!(k[(0, 2)], 320.0);
        assert_relative_eq!(k[(1, 2)], 240.0);
    }
}
