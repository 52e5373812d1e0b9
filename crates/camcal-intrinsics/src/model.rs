//! Pinhole camera with 5-term Brown-Conrady distortion.

use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

/// Distortion coefficients in the usual `k1, k2, p1, p2, k3` order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub const LEN: usize = 5;

    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    /// Accepts 4 (`k3 = 0`) or 5 coefficients.
    pub fn from_slice(c: &[f64]) -> Option<Self> {
        match *c {
            [k1, k2, p1, p2] => Some(Self {
                k1,
                k2,
                p1,
                p2,
                k3: 0.0,
            }),
            [k1, k2, p1, p2, k3] => Some(Self { k1, k2, p1, p2, k3 }),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.to_array().iter().all(|&v| v == 0.0)
    }

    /// Distort a normalized image point.
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration.
    pub fn undistort(&self, xd: f64, yd: f64, iterations: usize) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..iterations {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x, y)
    }
}

/// Camera matrix plus distortion. Always complete; replaced as a whole.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub camera_matrix: Matrix3<f64>,
    pub distortion: Distortion,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, distortion: Distortion) -> Self {
        Self {
            camera_matrix: Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0),
            distortion,
        }
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.camera_matrix[(0, 0)]
    }

    #[inline]
    pub fn fy(&self) -> f64 {
        self.camera_matrix[(1, 1)]
    }

    #[inline]
    pub fn cx(&self) -> f64 {
        self.camera_matrix[(0, 2)]
    }

    #[inline]
    pub fn cy(&self) -> f64 {
        self.camera_matrix[(1, 2)]
    }

    #[inline]
    fn skew(&self) -> f64 {
        self.camera_matrix[(0, 1)]
    }

    /// Project a point given in camera coordinates. `None` behind the camera.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= 1e-12 {
            return None;
        }
        let (xd, yd) = self.distortion.distort(p.x / p.z, p.y / p.z);
        Some(self.normalized_to_pixel(xd, yd))
    }

    #[inline]
    pub fn normalized_to_pixel(&self, x: f64, y: f64) -> Point2<f64> {
        Point2::new(
            self.fx() * x + self.skew() * y + self.cx(),
            self.fy() * y + self.cy(),
        )
    }

    #[inline]
    pub fn pixel_to_normalized(&self, p: Point2<f64>) -> (f64, f64) {
        let y = (p.y - self.cy()) / self.fy();
        let x = (p.x - self.cx() - self.skew() * y) / self.fx();
        (x, y)
    }

    /// Remove lens distortion from a pixel, keeping the same camera matrix.
    pub fn undistort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        let (xd, yd) = self.pixel_to_normalized(p);
        let (x, y) = self.distortion.undistort(xd, yd, 20);
        self.normalized_to_pixel(x, y)
    }

    pub fn is_finite(&self) -> bool {
        self.camera_matrix.iter().all(|v| v.is_finite())
            && self.distortion.to_array().iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Intrinsics {
        Intrinsics::new(
            800.0,
            780.0,
            320.0,
            240.0,
            Distortion {
                k1: -0.2,
                k2: 0.05,
                p1: 0.001,
                p2: -0.0005,
                k3: 0.0,
            },
        )
    }

    #[test]
    fn zero_distortion_is_identity() {
        let d = Distortion::default();
        assert_eq!(d.distort(0.3, -0.2), (0.3, -0.2));
        assert!(d.is_zero());
    }

    #[test]
    fn undistort_inverts_distort() {
        let d = sample().distortion;
        let (xd, yd) = d.distort(0.25, -0.15);
        let (x, y) = d.undistort(xd, yd, 30);
        assert_relative_eq!(x, 0.25, epsilon = 1e-9);
        assert_relative_eq!(y, -0.15, epsilon = 1e-9);
    }

    #[test]
    fn pixel_round_trip_through_projection() {
        let k = sample();
        let p = k.project(&Point3::new(0.1, -0.05, 1.0)).expect("in front");
        let undist = k.undistort_pixel(p);
        assert_relative_eq!(undist.x, 800.0 * 0.1 + 320.0, epsilon = 1e-6);
        assert_relative_eq!(undist.y, 780.0 * -0.05 + 240.0, epsilon = 1e-6);
        assert!(k.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn coefficient_slices() {
        let d = Distortion::from_slice(&[0.1, 0.2, 0.3, 0.4]).expect("four");
        assert_eq!(d.k3, 0.0);
        assert_eq!(Distortion::from_slice(&d.to_array()), Some(d));
        assert!(Distortion::from_slice(&[0.1; 8]).is_none());
    }
}
