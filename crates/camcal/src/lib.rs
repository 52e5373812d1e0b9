//! Webcam calibration and marker-based measurement.
//!
//! This crate ties the `camcal-*` crates into a pipeline:
//! - a camera abstraction with explicit open/closed state ([`camera`])
//! - frame-level chessboard and single-marker detection ([`detect`])
//! - a calibration session on a worker thread, with cooperative cancel and a
//!   per-shot attempt cap ([`session`])
//! - marker displacement and single-view recalibration measurements ([`measure`])
//! - a [`Controller`] exposing the control operations and the derived
//!   [`ControlState`] to a presentation layer
//!
//! ## Quickstart
//!
//! ```no_run
//! use camcal::camera::ImageDirectoryBackend;
//! use camcal::session::SessionConfig;
//! use camcal::Controller;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(ImageDirectoryBackend::new("captures"));
//! let mut controller = Controller::with_log_sink(backend)
//!     .with_session_config(SessionConfig::chessboard_10().without_delays());
//! controller.start_calibration(0)?;
//! if let Some(outcome) = controller.wait_calibration(Some(Duration::from_secs(60))) {
//!     println!("rms = {:.3}", outcome?.result.rms_error);
//! }
//! controller.save_calibration("calibration.xml")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `camcal::core`: images, corners, homographies, logging setup.
//! - `camcal::chessboard`: chessboard grid from ChESS corners.
//! - `camcal::aruco`: marker dictionaries and decoding.
//! - `camcal::intrinsics`: solver, calibration files, undistortion.

pub use camcal_aruco as aruco;
pub use camcal_chessboard as chessboard;
pub use camcal_core as core;
pub use camcal_intrinsics as intrinsics;

pub mod camera;
pub mod config;
pub mod controller;
pub mod detect;
mod error;
pub mod measure;
pub mod session;
pub mod state;
pub mod status;
pub mod worker;

pub use camera::{Camera, CameraBackend, CameraError, Frame, FrameSource};
pub use config::CamcalConfig;
pub use controller::{Controller, FrameProcessor};
pub use error::CamcalError;
pub use intrinsics::{undistort, Intrinsics, UndistortError};
pub use measure::{MeasureConfig, MeasurementOutcome, MeasurementRecord, MeasurementStrategy};
pub use session::{CalibrationOutcome, SessionConfig};
pub use state::{ControlState, ControllerState, MeasureState, Progress, SessionState};
pub use status::{LogSink, SessionEvent, StatusSink};
