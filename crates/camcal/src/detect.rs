//! Frame-level detection: ChESS corners into the chessboard detector, and
//! the single-marker detector, plus marker pose.

use crate::camera::Frame;
use camcal_aruco::{DictionaryError, MarkerDetection, MarkerDetector, MarkerDetectorParams};
use camcal_chessboard::{ChessboardDetection, ChessboardDetector, ChessboardParams};
use camcal_core::{estimate_homography, Corner, ImageError};
use camcal_intrinsics::{pose_from_homography, Intrinsics, Observation, Pose};
use chess_corners::{find_chess_corners_image, ChessConfig, CornerDescriptor};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] ImageError),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
}

/// ChESS settings that work for webcam-sized boards.
pub fn default_chess_config() -> ChessConfig {
    let mut cfg = ChessConfig::single_scale();
    cfg.params.threshold_rel = 0.2;
    cfg.params.nms_radius = 2;
    cfg
}

/// Validate `frame` and copy it into an `image::GrayImage`.
pub fn to_luma(frame: &Frame) -> Result<image::GrayImage, DetectError> {
    frame.validate()?;
    image::GrayImage::from_raw(frame.width as u32, frame.height as u32, frame.data.clone()).ok_or(
        DetectError::MalformedFrame(ImageError::InvalidDimensions {
            width: frame.width,
            height: frame.height,
        }),
    )
}

fn adapt_chess_corner(c: &CornerDescriptor) -> Corner {
    Corner::new(c.x, c.y, c.orientation, c.response)
}

pub fn detect_corners(img: &image::GrayImage, cfg: &ChessConfig) -> Vec<Corner> {
    find_chess_corners_image(img, cfg)
        .iter()
        .map(adapt_chess_corner)
        .collect()
}

/// ChESS corners → chessboard grid. `Ok(None)` when the full pattern is not visible.
#[cfg_attr(
    feature = "tracing",
    instrument(
        level = "info",
        skip(frame, chess_cfg, params),
        fields(width = frame.width, height = frame.height, cols = params.cols, rows = params.rows)
    )
)]
pub fn detect_chessboard(
    frame: &Frame,
    chess_cfg: &ChessConfig,
    params: &ChessboardParams,
) -> Result<Option<ChessboardDetection>, DetectError> {
    let img = to_luma(frame)?;
    let corners = detect_corners(&img, chess_cfg);
    Ok(ChessboardDetector::new(params.clone()).detect_from_corners(&corners))
}

/// A decoded marker with its corners in image pixels, top-left first and
/// clockwise, and its pose when one was estimated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub id: u32,
    pub corners: [Point2<f64>; 4],
    #[serde(default)]
    pub pose: Option<Pose>,
}

impl MarkerObservation {
    pub fn top_left(&self) -> Point2<f64> {
        self.corners[0]
    }

    pub fn top_right(&self) -> Point2<f64> {
        self.corners[1]
    }
}

impl From<&MarkerDetection> for MarkerObservation {
    fn from(d: &MarkerDetection) -> Self {
        Self {
            id: d.id,
            corners: d.corners.map(|p| Point2::new(p.x as f64, p.y as f64)),
            pose: None,
        }
    }
}

/// The single marker in `frame`; zero or several markers give `Ok(None)`.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(frame, detector), fields(width = frame.width, height = frame.height))
)]
pub fn detect_marker(
    frame: &Frame,
    detector: &MarkerDetector,
) -> Result<Option<MarkerObservation>, DetectError> {
    let found = detector.detect_single(&frame.view())?;
    Ok(found.as_ref().map(MarkerObservation::from))
}

/// Marker corners in the marker's own frame: centered, `z = 0`, x right and
/// y up, in top-left, top-right, bottom-right, bottom-left order.
pub fn marker_object_points(marker_length: f64) -> [Point3<f64>; 4] {
    let h = 0.5 * marker_length;
    [
        Point3::new(-h, h, 0.0),
        Point3::new(h, h, 0.0),
        Point3::new(h, -h, 0.0),
        Point3::new(-h, -h, 0.0),
    ]
}

/// Marker-to-camera pose from its four corners. Lens distortion is removed
/// from the corners before the planar homography is decomposed.
pub fn estimate_marker_pose(
    obs: &MarkerObservation,
    marker_length: f64,
    intrinsics: &Intrinsics,
) -> Option<Pose> {
    if marker_length.is_nan() || marker_length <= 0.0 {
        return None;
    }
    let object: Vec<Point2<f64>> = marker_object_points(marker_length)
        .iter()
        .map(|p| p.xy())
        .collect();
    let image: Vec<Point2<f64>> = obs
        .corners
        .iter()
        .map(|&p| intrinsics.undistort_pixel(p))
        .collect();
    let h = estimate_homography(&object, &image)?;
    pose_from_homography(&intrinsics.camera_matrix, &h)
}

/// Calibration target seen by a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetConfig {
    Chessboard {
        #[serde(default)]
        params: ChessboardParams,
        /// Side of one square, in the unit results should be reported in.
        square_size: f64,
    },
    Marker {
        #[serde(default)]
        params: MarkerDetectorParams,
        marker_length: f64,
    },
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::Chessboard {
            params: ChessboardParams::default(),
            square_size: 1.0,
        }
    }
}

impl TargetConfig {
    pub fn build(&self) -> Result<Box<dyn TargetDetector>, DetectError> {
        Ok(match self {
            Self::Chessboard {
                params,
                square_size,
            } => Box::new(ChessboardTarget {
                chess: default_chess_config(),
                params: params.clone(),
                square_size: *square_size,
            }),
            Self::Marker {
                params,
                marker_length,
            } => Box::new(MarkerTarget {
                detector: MarkerDetector::new(params.clone())?,
                marker_length: *marker_length,
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chessboard { .. } => "chessboard",
            Self::Marker { .. } => "marker",
        }
    }
}

/// Turns a frame into calibration correspondences when the target is visible.
pub trait TargetDetector: Send {
    fn observe(&mut self, frame: &Frame) -> Result<Option<Observation>, DetectError>;
}

struct ChessboardTarget {
    chess: ChessConfig,
    params: ChessboardParams,
    square_size: f64,
}

impl TargetDetector for ChessboardTarget {
    fn observe(&mut self, frame: &Frame) -> Result<Option<Observation>, DetectError> {
        let Some(board) = detect_chessboard(frame, &self.chess, &self.params)? else {
            return Ok(None);
        };
        let image = board
            .points()
            .iter()
            .map(|p| Point2::new(p.x as f64, p.y as f64))
            .collect();
        Ok(Some(Observation::planar_grid(
            board.cols,
            board.rows,
            self.square_size,
            image,
        )))
    }
}

struct MarkerTarget {
    detector: MarkerDetector,
    marker_length: f64,
}

impl TargetDetector for MarkerTarget {
    fn observe(&mut self, frame: &Frame) -> Result<Option<Observation>, DetectError> {
        let Some(marker) = detect_marker(frame, &self.detector)? else {
            return Ok(None);
        };
        Ok(Some(Observation::new(
            marker_object_points(self.marker_length).to_vec(),
            marker.corners.to_vec(),
        )))
    }
}
