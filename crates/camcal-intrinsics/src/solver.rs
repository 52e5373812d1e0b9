//! Planar-target intrinsics calibration.
//!
//! 1. Per-view homography from the `z = 0` target plane to the image.
//! 2. Focal lengths from the orthogonality constraints with the principal
//!    point at the image center.
//! 3. Per-view pose from `K⁻¹H`.
//! 4. Joint Levenberg-Marquardt refinement of intrinsics, distortion and
//!    every pose on the reprojection error.

use crate::lm::{self, diff_step, LeastSquaresProblem, LmOptions, TerminationReason};
use crate::model::{Distortion, Intrinsics};
use crate::pose::{pose_from_homography, Pose};
use camcal_core::estimate_homography;
use log::{debug, info, warn};
use nalgebra::{DMatrix, Matrix2, Matrix3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::instrument;

const NUM_INTRINSIC: usize = 9;
const NUM_POSE: usize = 6;
const BEHIND_CAMERA_RESIDUAL: f64 = 1e6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolverError {
    #[error("no observations")]
    NoObservations,
    #[error("view {view}: {count} points, at least 4 required")]
    TooFewPoints { view: usize, count: usize },
    #[error("view {view}: {object} object points but {image} image points")]
    LengthMismatch {
        view: usize,
        object: usize,
        image: usize,
    },
    #[error("view {view}: target points are not on the z = 0 plane")]
    NonPlanarTarget { view: usize },
    #[error("view {view}: degenerate point configuration")]
    DegenerateView { view: usize },
    #[error("invalid image size {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },
    #[error("refinement did not converge: {0}")]
    NonConvergence(String),
}

/// Matched target and image points of one accepted frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
}

impl Observation {
    pub fn new(object_points: Vec<Point3<f64>>, image_points: Vec<Point2<f64>>) -> Self {
        Self {
            object_points,
            image_points,
        }
    }

    /// Target points `(k * square, j * square, 0)` of a `cols × rows`
    /// grid, row by row, paired with `image_points` in the same order.
    pub fn planar_grid(cols: u32, rows: u32, square: f64, image_points: Vec<Point2<f64>>) -> Self {
        Self::new(grid_object_points(cols, rows, square), image_points)
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }
}

pub fn grid_object_points(cols: u32, rows: u32, square: f64) -> Vec<Point3<f64>> {
    (0..rows)
        .flat_map(|j| (0..cols).map(move |k| Point3::new(k as f64 * square, j as f64 * square, 0.0)))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// `None` fixes the principal point only when there are fewer than
    /// three views.
    pub fix_principal_point: Option<bool>,
    pub fix_tangential: bool,
    pub fix_k3: bool,
    pub lm: LmOptions,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            fix_principal_point: None,
            fix_tangential: false,
            fix_k3: false,
            lm: LmOptions::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub intrinsics: Intrinsics,
    pub poses: Vec<Pose>,
    /// Root mean square reprojection error over all points, in pixels.
    pub rms_error: f64,
    pub per_view_rms: Vec<f64>,
    pub iterations: usize,
    pub termination: TerminationReason,
}

#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(observations, opts), fields(views = observations.len()))
)]
pub fn calibrate(
    observations: &[Observation],
    image_size: ImageSize,
    opts: &SolverOptions,
) -> Result<CalibrationResult, SolverError> {
    validate(observations, image_size)?;

    let cx = (image_size.width as f64 - 1.0) * 0.5;
    let cy = (image_size.height as f64 - 1.0) * 0.5;

    let mut homographies = Vec::with_capacity(observations.len());
    for (view, obs) in observations.iter().enumerate() {
        let plane: Vec<Point2<f64>> = obs.object_points.iter().map(|p| p.xy()).collect();
        let h = estimate_homography(&plane, &obs.image_points)
            .ok_or(SolverError::DegenerateView { view })?;
        homographies.push(h);
    }

    let (fx, fy) = initial_focal(&homographies, cx, cy).unwrap_or_else(|| {
        let f = image_size.width.max(image_size.height) as f64;
        warn!("focal length not observable from the views, starting at {f}");
        (f, f)
    });
    let k0 = Intrinsics::new(fx, fy, cx, cy, Distortion::default());
    debug!("initial fx={fx:.2} fy={fy:.2} cx={cx:.2} cy={cy:.2}");

    let mut x0 = Vec::with_capacity(NUM_INTRINSIC + NUM_POSE * observations.len());
    x0.extend_from_slice(&[fx, fy, cx, cy]);
    x0.extend_from_slice(&k0.distortion.to_array());
    for (view, h) in homographies.iter().enumerate() {
        let pose = pose_from_homography(&k0.camera_matrix, h)
            .ok_or(SolverError::DegenerateView { view })?;
        x0.extend_from_slice(&pose.to_params());
    }

    let fix_pp = opts
        .fix_principal_point
        .unwrap_or(observations.len() < 3);
    let mut free = vec![true; x0.len()];
    if fix_pp {
        free[2] = false;
        free[3] = false;
    }
    if opts.fix_tangential {
        free[6] = false;
        free[7] = false;
    }
    if opts.fix_k3 {
        free[8] = false;
    }

    let problem = Reprojection::new(observations);
    let report = lm::minimize(&problem, &x0, &free, &opts.lm);
    debug!(
        "refinement: {} iterations, {:?}, cost {:.3e}",
        report.iterations, report.termination, report.cost
    );

    let x = report.params;
    let intrinsics = unpack_intrinsics(&x);
    if !intrinsics.is_finite() || report.cost.is_nan() {
        return Err(SolverError::NonConvergence("non-finite parameters".into()));
    }
    if intrinsics.fx() <= 0.0 || intrinsics.fy() <= 0.0 {
        return Err(SolverError::NonConvergence(format!(
            "non-positive focal length ({:.3}, {:.3})",
            intrinsics.fx(),
            intrinsics.fy()
        )));
    }

    let poses: Vec<Pose> = (0..observations.len())
        .map(|v| Pose::from_params(&x[pose_offset(v)..pose_offset(v) + NUM_POSE]))
        .collect();

    let mut per_view_rms = Vec::with_capacity(observations.len());
    let mut total_sq = 0.0;
    let mut total_pts = 0usize;
    for (obs, pose) in observations.iter().zip(&poses) {
        let sq = squared_reprojection_error(&intrinsics, pose, obs);
        per_view_rms.push((sq / obs.len() as f64).sqrt());
        total_sq += sq;
        total_pts += obs.len();
    }
    let rms_error = (total_sq / total_pts as f64).sqrt();
    if !rms_error.is_finite() {
        return Err(SolverError::NonConvergence("non-finite reprojection error".into()));
    }

    info!(
        "calibrated {} views: fx={:.2} fy={:.2} cx={:.2} cy={:.2} rms={:.4}px",
        observations.len(),
        intrinsics.fx(),
        intrinsics.fy(),
        intrinsics.cx(),
        intrinsics.cy(),
        rms_error
    );

    Ok(CalibrationResult {
        intrinsics,
        poses,
        rms_error,
        per_view_rms,
        iterations: report.iterations,
        termination: report.termination,
    })
}

/// Sum of squared pixel residuals of one view.
pub fn squared_reprojection_error(k: &Intrinsics, pose: &Pose, obs: &Observation) -> f64 {
    obs.object_points
        .iter()
        .zip(&obs.image_points)
        .map(|(p, q)| match k.project(&pose.transform(p)) {
            Some(proj) => (proj - q).norm_squared(),
            None => f64::INFINITY,
        })
        .sum()
}

fn validate(observations: &[Observation], size: ImageSize) -> Result<(), SolverError> {
    if observations.is_empty() {
        return Err(SolverError::NoObservations);
    }
    if size.width == 0 || size.height == 0 {
        return Err(SolverError::InvalidImageSize {
            width: size.width,
            height: size.height,
        });
    }
    for (view, obs) in observations.iter().enumerate() {
        if obs.object_points.len() != obs.image_points.len() {
            return Err(SolverError::LengthMismatch {
                view,
                object: obs.object_points.len(),
                image: obs.image_points.len(),
            });
        }
        if obs.len() < 4 {
            return Err(SolverError::TooFewPoints {
                view,
                count: obs.len(),
            });
        }
        let extent = obs
            .object_points
            .iter()
            .map(|p| p.x.abs().max(p.y.abs()))
            .fold(0.0, f64::max);
        if obs
            .object_points
            .iter()
            .any(|p| p.z.abs() > 1e-9 * extent.max(1.0))
        {
            return Err(SolverError::NonPlanarTarget { view });
        }
        let finite = obs
            .object_points
            .iter()
            .all(|p| p.iter().all(|v| v.is_finite()))
            && obs
                .image_points
                .iter()
                .all(|p| p.iter().all(|v| v.is_finite()));
        if !finite {
            return Err(SolverError::DegenerateView { view });
        }
    }
    Ok(())
}

/// Solve `h1ᵀωh2 = 0` and `h1ᵀωh1 = h2ᵀωh2` for `ω = diag(1/fx², 1/fy², 1)`
/// in the least-squares sense over all views.
fn initial_focal(homographies: &[camcal_core::Homography], cx: f64, cy: f64) -> Option<(f64, f64)> {
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for h in homographies {
        let hc = shift * h.h;
        let (h1, h2) = (hc.column(0), hc.column(1));
        let rows = [
            (
                Vector2::new(h1[0] * h2[0], h1[1] * h2[1]),
                -h1[2] * h2[2],
            ),
            (
                Vector2::new(h1[0] * h1[0] - h2[0] * h2[0], h1[1] * h1[1] - h2[1] * h2[1]),
                -(h1[2] * h1[2] - h2[2] * h2[2]),
            ),
        ];
        for (a, b) in rows {
            let norm = a.norm();
            if norm < 1e-12 {
                continue;
            }
            let (a, b) = (a / norm, b / norm);
            ata += a * a.transpose();
            atb += a * b;
        }
    }

    let eig = ata.symmetric_eigen();
    let (lo, hi) = (eig.eigenvalues.min(), eig.eigenvalues.max());
    if hi <= 0.0 || lo / hi < 1e-10 {
        return None;
    }
    let w = ata.try_inverse()? * atb;
    if !(w[0] > 0.0 && w[1] > 0.0) {
        return None;
    }
    let (fx, fy) = (1.0 / w[0].sqrt(), 1.0 / w[1].sqrt());
    (fx.is_finite() && fy.is_finite()).then_some((fx, fy))
}

#[inline]
fn pose_offset(view: usize) -> usize {
    NUM_INTRINSIC + NUM_POSE * view
}

fn unpack_intrinsics(x: &[f64]) -> Intrinsics {
    let distortion = Distortion {
        k1: x[4],
        k2: x[5],
        p1: x[6],
        p2: x[7],
        k3: x[8],
    };
    Intrinsics::new(x[0], x[1], x[2], x[3], distortion)
}

/// Reprojection residuals, two per point, views laid out back to back.
struct Reprojection<'a> {
    observations: &'a [Observation],
    offsets: Vec<usize>,
    num_residuals: usize,
}

impl<'a> Reprojection<'a> {
    fn new(observations: &'a [Observation]) -> Self {
        let mut offsets = Vec::with_capacity(observations.len());
        let mut acc = 0;
        for obs in observations {
            offsets.push(acc);
            acc += 2 * obs.len();
        }
        Self {
            observations,
            offsets,
            num_residuals: acc,
        }
    }

    fn view_residuals(&self, x: &[f64], view: usize, out: &mut [f64]) {
        let k = unpack_intrinsics(x);
        let pose = Pose::from_params(&x[pose_offset(view)..pose_offset(view) + NUM_POSE]);
        let obs = &self.observations[view];
        for (n, (p, q)) in obs.object_points.iter().zip(&obs.image_points).enumerate() {
            let (ex, ey) = match k.project(&pose.transform(p)) {
                Some(proj) => (proj.x - q.x, proj.y - q.y),
                None => (BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL),
            };
            out[2 * n] = ex;
            out[2 * n + 1] = ey;
        }
    }
}

impl LeastSquaresProblem for Reprojection<'_> {
    fn num_params(&self) -> usize {
        pose_offset(self.observations.len())
    }

    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn residuals(&self, x: &[f64], out: &mut [f64]) {
        for (view, obs) in self.observations.iter().enumerate() {
            let start = self.offsets[view];
            self.view_residuals(x, view, &mut out[start..start + 2 * obs.len()]);
        }
    }

    /// Central differences. Each pose only touches its own view.
    fn jacobian(&self, x: &[f64], jac: &mut DMatrix<f64>) {
        jac.fill(0.0);
        let mut xp = x.to_vec();
        for (view, obs) in self.observations.iter().enumerate() {
            let start = self.offsets[view];
            let len = 2 * obs.len();
            let mut plus = vec![0.0; len];
            let mut minus = vec![0.0; len];
            let params = (0..NUM_INTRINSIC).chain(pose_offset(view)..pose_offset(view) + NUM_POSE);
            for i in params {
                let h = diff_step(x[i]);
                xp[i] = x[i] + h;
                self.view_residuals(&xp, view, &mut plus);
                xp[i] = x[i] - h;
                self.view_residuals(&xp, view, &mut minus);
                xp[i] = x[i];
                for r in 0..len {
                    jac[(start + r, i)] = (plus[r] - minus[r]) / (2.0 * h);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_view() -> Observation {
        Observation::planar_grid(
            2,
            2,
            1.0,
            vec![
                Point2::new(0.0, 0.0),
                Point2::new(10.0, 0.0),
                Point2::new(0.0, 10.0),
                Point2::new(10.0, 10.0),
            ],
        )
    }

    #[test]
    fn grid_points_are_row_major() {
        let pts = grid_object_points(3, 2, 0.5);
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[1], Point3::new(0.5, 0.0, 0.0));
        assert_eq!(pts[3], Point3::new(0.0, 0.5, 0.0));
    }

    #[test]
    fn rejects_invalid_input() {
        let size = ImageSize::new(640, 480);
        let opts = SolverOptions::default();
        assert_eq!(calibrate(&[], size, &opts), Err(SolverError::NoObservations));

        let mut short = square_view();
        short.object_points.pop();
        short.image_points.pop();
        assert_eq!(
            calibrate(&[short], size, &opts),
            Err(SolverError::TooFewPoints { view: 0, count: 3 })
        );

        let mut mismatched = square_view();
        mismatched.image_points.pop();
        assert_eq!(
            calibrate(&[square_view(), mismatched], size, &opts),
            Err(SolverError::LengthMismatch {
                view: 1,
                object: 4,
                image: 3
            })
        );

        let mut lifted = square_view();
        lifted.object_points[2].z = 0.5;
        assert_eq!(
            calibrate(&[lifted], size, &opts),
            Err(SolverError::NonPlanarTarget { view: 0 })
        );

        let mut collinear = square_view();
        for (k, p) in collinear.image_points.iter_mut().enumerate() {
            *p = Point2::new(k as f64, k as f64);
        }
        assert_eq!(
            calibrate(&[collinear], size, &opts),
            Err(SolverError::DegenerateView { view: 0 })
        );

        assert!(matches!(
            calibrate(&[square_view()], ImageSize::new(0, 480), &opts),
            Err(SolverError::InvalidImageSize { .. })
        ));
    }

    #[test]
    fn fronto_parallel_views_fall_back_to_image_size() {
        let h = camcal_core::Homography::new(Matrix3::new(
            100.0, 0.0, 320.0, 0.0, 100.0, 240.0, 0.0, 0.0, 1.0,
        ));
        assert!(initial_focal(&[h], 319.5, 239.5).is_none());
    }
}
