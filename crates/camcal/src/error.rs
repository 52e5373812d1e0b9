use crate::camera::CameraError;
use crate::detect::DetectError;
use camcal_core::ImageError;
use camcal_intrinsics::{SolverError, StoreError, UndistortError};
use std::path::PathBuf;

/// Every way a camera activity or control operation can end badly.
#[derive(thiserror::Error, Debug)]
pub enum CamcalError {
    #[error("camera {index} unavailable: {reason}")]
    DeviceUnavailable { index: usize, reason: String },

    #[error("no frame from camera after {reads} empty reads")]
    FrameReadFailure { reads: u32 },

    #[error("calibration solve failed: {0}")]
    SolverFailure(#[from] SolverError),

    #[error("no calibration loaded")]
    NotCalibrated,

    #[error("malformed data in {path}: {reason}")]
    MalformedPersistedData { path: PathBuf, reason: String },

    #[error("{activity} already running")]
    AlreadyRunning { activity: &'static str },

    #[error("cancelled")]
    Cancelled,

    #[error("no marker detected before the stream ended")]
    NoMarkerDetected,

    #[error("shot {shot}: target not found in {attempts} attempts")]
    AttemptLimit { shot: u32, attempts: u32 },

    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl CamcalError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<CameraError> for CamcalError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceUnavailable { index, reason } => {
                Self::DeviceUnavailable { index, reason }
            }
        }
    }
}

impl From<StoreError> for CamcalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io { path, source } => Self::Io { path, source },
            StoreError::Malformed { path, reason } => Self::MalformedPersistedData { path, reason },
            StoreError::Encode(reason) => Self::MalformedPersistedData {
                path: PathBuf::new(),
                reason,
            },
        }
    }
}

impl From<UndistortError> for CamcalError {
    fn from(e: UndistortError) -> Self {
        match e {
            UndistortError::NotCalibrated => Self::NotCalibrated,
            UndistortError::InvalidFrame(e) => Self::Detect(DetectError::MalformedFrame(e)),
            UndistortError::SizeMismatch { width, height, .. } => Self::Detect(
                DetectError::MalformedFrame(ImageError::InvalidDimensions { width, height }),
            ),
        }
    }
}
