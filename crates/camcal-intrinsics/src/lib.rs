//! Camera intrinsics for `camcal`.
//!
//! - [`model`]: pinhole camera matrix with `k1, k2, p1, p2, k3` distortion.
//! - [`solver`]: calibration from planar target views (homography init,
//!   Levenberg-Marquardt refinement).
//! - [`store`]: XML / JSON calibration files.
//! - [`undistort`]: inverse-map undistortion of grayscale frames.
//!
//! ```
//! use camcal_intrinsics::{undistort, Distortion, Intrinsics, UndistortError};
//! use camcal_core::GrayImage;
//!
//! let frame = GrayImage::filled(64, 48, 128);
//! assert_eq!(undistort(&frame, None), Err(UndistortError::NotCalibrated));
//!
//! let k = Intrinsics::new(60.0, 60.0, 31.5, 23.5, Distortion::default());
//! assert_eq!(undistort(&frame, Some(&k)).unwrap(), frame);
//! ```

pub mod lm;
pub mod model;
pub mod pose;
pub mod solver;
pub mod store;
pub mod undistort;

pub use lm::{LmOptions, TerminationReason};
pub use model::{Distortion, Intrinsics};
pub use pose::{pose_from_homography, Pose};
pub use solver::{
    calibrate, grid_object_points, CalibrationResult, ImageSize, Observation, SolverError,
    SolverOptions,
};
pub use store::{CalibrationFormat, StoreError};
pub use undistort::{undistort, UndistortError, UndistortMap};
