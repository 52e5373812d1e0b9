//! Rigid board-to-camera poses.

use camcal_core::Homography;
use nalgebra::{Matrix3, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Transform from target coordinates into camera coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Axis-angle (Rodrigues) vector and translation, 6 parameters.
    pub fn to_params(&self) -> [f64; 6] {
        let r = self.rotation.scaled_axis();
        let t = self.translation;
        [r.x, r.y, r.z, t.x, t.y, t.z]
    }

    pub fn from_params(p: &[f64]) -> Self {
        Self {
            rotation: Rotation3::new(Vector3::new(p[0], p[1], p[2])),
            translation: Vector3::new(p[3], p[4], p[5]),
        }
    }

    #[inline]
    pub fn transform(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation * p + self.translation
    }
}

/// Recover the pose of the `z = 0` plane from `H ~ K [r1 r2 t]`.
///
/// The two rotation columns are re-orthogonalized with an SVD. Returns
/// `None` for a singular `K` or a degenerate homography.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Homography) -> Option<Pose> {
    let k_inv = k.try_inverse()?;
    let m = k_inv * h.h;
    let (c1, c2, c3) = (m.column(0), m.column(1), m.column(2));

    let n1 = c1.norm();
    let n2 = c2.norm();
    if n1 < 1e-12 || n2 < 1e-12 {
        return None;
    }
    let mut scale = 2.0 / (n1 + n2);
    // The plane must lie in front of the camera.
    if c3[2] * scale < 0.0 {
        scale = -scale;
    }

    let r1: Vector3<f64> = c1 * scale;
    let r2: Vector3<f64> = c2 * scale;
    let r3 = r1.cross(&r2);
    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = approx.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }

    let t: Vector3<f64> = c3 * scale;
    if !t.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Pose::new(Rotation3::from_matrix_unchecked(r), t))
}
