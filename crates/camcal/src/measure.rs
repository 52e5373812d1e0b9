//! Measurement engine.
//!
//! Two strategies, chosen at start:
//!
//! * [`MeasurementStrategy::MarkerDisplacement`]: find the marker, wait for
//!   the operator to move the probe, find it again, and report the distance
//!   between the two ruler end points.
//! * [`MeasurementStrategy::ChessboardRecalibration`]: solve intrinsics from a
//!   single chessboard view and record them.
//!
//! Results are appended to a `MeasurementData` XML document.

use crate::camera::{Camera, CameraBackend, Frame};
use crate::detect::{
    detect_marker, estimate_marker_pose, DetectError, MarkerObservation, TargetConfig,
    TargetDetector,
};
use crate::error::CamcalError;
use crate::state::{MeasureState, Shared};
use crate::status::{Reporter, SessionEvent};
use crate::worker::{CancelToken, Worker};
use camcal_aruco::{MarkerDetector, MarkerDetectorParams};
use camcal_chessboard::ChessboardParams;
use camcal_intrinsics::store::{XmlCameraMatrix, XmlCells, XML_DECLARATION};
use camcal_intrinsics::{calibrate, CalibrationResult, ImageSize, Intrinsics, SolverOptions};
use log::{debug, info};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// How a measurement is taken.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementStrategy {
    MarkerDisplacement {
        /// Distance from the marker's top-right corner to the ruler tip,
        /// in the unit of `marker_length`.
        offset: f64,
        marker_length: f64,
    },
    ChessboardRecalibration { square_size: f64 },
}

impl Default for MeasurementStrategy {
    fn default() -> Self {
        Self::MarkerDisplacement {
            offset: 0.0,
            marker_length: 0.02,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    pub strategy: MeasurementStrategy,
    pub marker: MarkerDetectorParams,
    pub chessboard: ChessboardParams,
    /// Frames examined per search before giving up; `None` searches until
    /// the stream ends or the session is cancelled.
    pub max_attempts: Option<u32>,
    /// Measurement document the result is appended to.
    pub output_path: Option<PathBuf>,
    /// Solver settings for single-view recalibration.
    pub solver: SolverOptions,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            strategy: MeasurementStrategy::default(),
            marker: MarkerDetectorParams::default(),
            chessboard: ChessboardParams::default(),
            max_attempts: None,
            output_path: None,
            solver: SolverOptions::default(),
        }
    }
}

impl MeasureConfig {
    /// Marker displacement with the given ruler offset.
    pub fn marker_displacement(offset: f64, marker_length: f64) -> Self {
        Self {
            strategy: MeasurementStrategy::MarkerDisplacement {
                offset,
                marker_length,
            },
            ..Self::default()
        }
    }

    /// Replace the ruler offset, keeping the strategy otherwise intact.
    pub fn with_offset(mut self, new_offset: f64) -> Self {
        if let MeasurementStrategy::MarkerDisplacement { offset, .. } = &mut self.strategy {
            *offset = new_offset;
        }
        self
    }
}

/// Point on the ruler, `offset` back from the top-right corner along the
/// marker's top edge, scaled from marker units to pixels.
///
/// `None` when the top edge or `marker_length` is degenerate.
pub fn ruler_end_point(
    top_left: Point2<f64>,
    top_right: Point2<f64>,
    marker_length: f64,
    offset: f64,
) -> Option<Point2<f64>> {
    let edge = top_right - top_left;
    let edge_len = edge.norm();
    if !(edge_len.is_finite() && edge_len > 0.0 && marker_length.is_finite() && marker_length > 0.0)
    {
        return None;
    }
    let adjusted = edge_len / marker_length * offset;
    Some(top_right - edge / edge_len * adjusted)
}

pub fn distance(a: Point2<f64>, b: Point2<f64>) -> f64 {
    (b - a).norm()
}

/// Both marker sightings of one displacement measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub initial: MarkerObservation,
    pub initial_end_point: Point2<f64>,
    pub moved: MarkerObservation,
    pub moved_end_point: Point2<f64>,
    pub distance: f64,
}

impl MeasurementRecord {
    pub fn new(
        initial: MarkerObservation,
        initial_end_point: Point2<f64>,
        moved: MarkerObservation,
        moved_end_point: Point2<f64>,
    ) -> Self {
        Self {
            distance: distance(initial_end_point, moved_end_point),
            initial,
            initial_end_point,
            moved,
            moved_end_point,
        }
    }
}

#[derive(Clone, Debug)]
pub enum MeasurementOutcome {
    Displacement(MeasurementRecord),
    Recalibration(Box<CalibrationResult>),
}

impl MeasurementOutcome {
    pub fn distance(&self) -> Option<f64> {
        match self {
            Self::Displacement(r) => Some(r.distance),
            Self::Recalibration(_) => None,
        }
    }

    fn entries(&self) -> Vec<MeasurementEntry> {
        match self {
            Self::Displacement(r) => vec![
                MeasurementEntry::InitialMarker(XmlMarker::from(&r.initial)),
                MeasurementEntry::InitialRulerEndPoint(XmlPoint::from(r.initial_end_point)),
                MeasurementEntry::MovedMarker(XmlMarker::from(&r.moved)),
                MeasurementEntry::MovedRulerEndPoint(XmlPoint::from(r.moved_end_point)),
                MeasurementEntry::Distance(r.distance),
            ],
            Self::Recalibration(result) => vec![
                MeasurementEntry::CameraMatrix(XmlCameraMatrix::from_matrix(
                    &result.intrinsics.camera_matrix,
                )),
                MeasurementEntry::DistCoeffs(XmlCells::from_values(
                    &result.intrinsics.distortion.to_array(),
                )),
            ],
        }
    }
}

/// `X`/`Y` attribute pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct XmlPoint {
    #[serde(rename = "@X")]
    pub x: f64,
    #[serde(rename = "@Y")]
    pub y: f64,
}

impl From<Point2<f64>> for XmlPoint {
    fn from(p: Point2<f64>) -> Self {
        Self { x: p.x, y: p.y }
    }
}

impl From<XmlPoint> for Point2<f64> {
    fn from(p: XmlPoint) -> Self {
        Point2::new(p.x, p.y)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XmlMarker {
    #[serde(rename = "@ID")]
    pub id: u32,
    #[serde(rename = "Corner", default)]
    pub corners: Vec<XmlPoint>,
}

impl From<&MarkerObservation> for XmlMarker {
    fn from(m: &MarkerObservation) -> Self {
        Self {
            id: m.id,
            corners: m.corners.iter().map(|&p| XmlPoint::from(p)).collect(),
        }
    }
}

/// One child element of a measurement document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MeasurementEntry {
    InitialMarker(XmlMarker),
    InitialRulerEndPoint(XmlPoint),
    MovedMarker(XmlMarker),
    MovedRulerEndPoint(XmlPoint),
    Distance(f64),
    CameraMatrix(XmlCameraMatrix),
    DistCoeffs(XmlCells),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "MeasurementData")]
struct MeasurementXml {
    #[serde(rename = "$value", default)]
    entries: Vec<MeasurementEntry>,
}

fn malformed(path: &Path, reason: impl ToString) -> CamcalError {
    CamcalError::MalformedPersistedData {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Entries of an existing measurement document; empty when `path` does not exist.
pub fn read_measurements(path: impl AsRef<Path>) -> Result<Vec<MeasurementEntry>, CamcalError> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() || path.is_dir() {
        return Err(malformed(path, "not a file path"));
    }
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|source| CamcalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: MeasurementXml = quick_xml::de::from_str(&text).map_err(|e| malformed(path, e))?;
    Ok(doc.entries)
}

/// Append `entries` to the document at `path`, creating it when missing.
/// An unreadable existing document is left as it was.
pub fn append_measurements(
    path: impl AsRef<Path>,
    entries: Vec<MeasurementEntry>,
) -> Result<(), CamcalError> {
    let path = path.as_ref();
    let mut doc = MeasurementXml {
        entries: read_measurements(path)?,
    };
    doc.entries.extend(entries);
    let body = quick_xml::se::to_string(&doc).map_err(|e| malformed(path, e))?;
    fs::write(path, format!("{XML_DECLARATION}{body}")).map_err(|source| CamcalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("{} measurement entries in {}", doc.entries.len(), path.display());
    Ok(())
}

/// Blocks a measurement until the operator has repositioned the probe.
pub trait Acknowledger: Send + Sync {
    /// `false` when `cancel` fired first.
    fn wait_for_reposition(&self, cancel: &CancelToken) -> bool;
}

/// Proceeds at once.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateAcknowledger;

impl Acknowledger for ImmediateAcknowledger {
    fn wait_for_reposition(&self, cancel: &CancelToken) -> bool {
        !cancel.is_cancelled()
    }
}

/// Proceeds when the paired [`AckHandle`] sends.
#[derive(Debug)]
pub struct ChannelAcknowledger {
    rx: Mutex<Receiver<()>>,
}

/// Sending half of a [`ChannelAcknowledger`].
#[derive(Clone, Debug)]
pub struct AckHandle(Sender<()>);

impl AckHandle {
    /// `false` when the measurement side is gone.
    pub fn acknowledge(&self) -> bool {
        self.0.send(()).is_ok()
    }
}

const ACK_POLL: Duration = Duration::from_millis(10);

impl ChannelAcknowledger {
    pub fn new() -> (Self, AckHandle) {
        let (tx, rx) = mpsc::channel();
        (Self { rx: Mutex::new(rx) }, AckHandle(tx))
    }
}

impl Acknowledger for ChannelAcknowledger {
    fn wait_for_reposition(&self, cancel: &CancelToken) -> bool {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match rx.recv_timeout(ACK_POLL) {
                Ok(()) => return !cancel.is_cancelled(),
                Err(RecvTimeoutError::Timeout) => continue,
                // Nobody can acknowledge any more; wait for the cancel.
                Err(RecvTimeoutError::Disconnected) => {
                    while cancel.sleep(ACK_POLL) {}
                    return false;
                }
            }
        }
    }
}

struct Ctx<'a> {
    state: &'a Shared<MeasureState>,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
    max_attempts: Option<u32>,
}

impl Ctx<'_> {
    fn enter(&self, state: MeasureState) {
        self.state.set(state);
        self.reporter.event(SessionEvent::MeasurementState(state));
    }

    /// Read frames until `probe` accepts one.
    fn search<T>(
        &self,
        camera: &mut Camera,
        phase: u32,
        mut probe: impl FnMut(&Frame) -> Result<Option<T>, CamcalError>,
    ) -> Result<T, CamcalError> {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CamcalError::Cancelled);
            }
            let frame = camera.read_frame().ok_or(CamcalError::NoMarkerDetected)?;
            attempts += 1;
            if let Some(found) = probe(&frame)? {
                return Ok(found);
            }
            if self.max_attempts.is_some_and(|cap| attempts >= cap) {
                return Err(CamcalError::AttemptLimit {
                    shot: phase,
                    attempts,
                });
            }
        }
    }
}

/// Run one measurement on the calling thread.
///
/// Nothing is written unless the measurement completes.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all))]
pub fn run_measurement(
    camera: &mut Camera,
    intrinsics: Option<&Intrinsics>,
    config: &MeasureConfig,
    acknowledger: &dyn Acknowledger,
    cancel: &CancelToken,
    state: &Shared<MeasureState>,
    reporter: &Reporter,
) -> Result<MeasurementOutcome, CamcalError> {
    let ctx = Ctx {
        state,
        reporter,
        cancel,
        max_attempts: config.max_attempts,
    };
    let outcome = intrinsics.ok_or(CamcalError::NotCalibrated).and_then(|k| {
        let outcome = match &config.strategy {
            MeasurementStrategy::MarkerDisplacement {
                offset,
                marker_length,
            } => {
                let detector =
                    MarkerDetector::new(config.marker.clone()).map_err(DetectError::from)?;
                let ruler = Ruler {
                    detector: &detector,
                    intrinsics: k,
                    marker_length: *marker_length,
                    offset: *offset,
                };
                displacement(camera, &ruler, acknowledger, &ctx)?
            }
            MeasurementStrategy::ChessboardRecalibration { square_size } => {
                let mut board = TargetConfig::Chessboard {
                    params: config.chessboard.clone(),
                    square_size: *square_size,
                }
                .build()?;
                recalibrate(camera, board.as_mut(), &config.solver, &ctx)?
            }
        };
        persist(outcome, config, &ctx)
    });
    conclude(&ctx, outcome)
}

/// The single-view recalibration strategy with a caller-supplied board
/// detector; `config.strategy` is not consulted.
pub fn run_recalibration(
    camera: &mut Camera,
    intrinsics: Option<&Intrinsics>,
    board: &mut dyn TargetDetector,
    config: &MeasureConfig,
    cancel: &CancelToken,
    state: &Shared<MeasureState>,
    reporter: &Reporter,
) -> Result<MeasurementOutcome, CamcalError> {
    let ctx = Ctx {
        state,
        reporter,
        cancel,
        max_attempts: config.max_attempts,
    };
    let outcome = intrinsics
        .ok_or(CamcalError::NotCalibrated)
        .and_then(|_| recalibrate(camera, board, &config.solver, &ctx))
        .and_then(|outcome| persist(outcome, config, &ctx));
    conclude(&ctx, outcome)
}

fn conclude(
    ctx: &Ctx<'_>,
    outcome: Result<MeasurementOutcome, CamcalError>,
) -> Result<MeasurementOutcome, CamcalError> {
    match &outcome {
        Ok(MeasurementOutcome::Displacement(r)) => {
            ctx.enter(MeasureState::Completed);
            ctx.reporter.event(SessionEvent::Measured {
                distance: r.distance,
            });
            ctx.reporter
                .status(format!("Measured distance: {:.3}", r.distance));
        }
        Ok(MeasurementOutcome::Recalibration(r)) => {
            ctx.enter(MeasureState::Completed);
            ctx.reporter.event(SessionEvent::Calibrated {
                rms_error: r.rms_error,
            });
            ctx.reporter.status(format!(
                "Single-view calibration done, reprojection error {:.4} px",
                r.rms_error
            ));
        }
        Err(CamcalError::Cancelled) => {
            ctx.enter(MeasureState::Cancelled);
            ctx.reporter.status("Measurement cancelled");
        }
        Err(e) => {
            ctx.enter(MeasureState::Failed);
            ctx.reporter.status(format!("Measurement failed: {e}"));
        }
    }
    outcome
}

struct Ruler<'a> {
    detector: &'a MarkerDetector,
    intrinsics: &'a Intrinsics,
    marker_length: f64,
    offset: f64,
}

impl Ruler<'_> {
    /// The marker in `frame` with its pose, and the ruler end point.
    fn sight(&self, frame: &Frame) -> Result<Option<(MarkerObservation, Point2<f64>)>, CamcalError> {
        let Some(mut marker) = detect_marker(frame, self.detector)? else {
            return Ok(None);
        };
        let Some(end) = ruler_end_point(
            marker.top_left(),
            marker.top_right(),
            self.marker_length,
            self.offset,
        ) else {
            return Ok(None);
        };
        marker.pose = estimate_marker_pose(&marker, self.marker_length, self.intrinsics);
        Ok(Some((marker, end)))
    }
}

fn displacement(
    camera: &mut Camera,
    ruler: &Ruler<'_>,
    acknowledger: &dyn Acknowledger,
    ctx: &Ctx<'_>,
) -> Result<MeasurementOutcome, CamcalError> {
    ctx.enter(MeasureState::SearchingInitial);
    ctx.reporter.status("Looking for the marker");
    let (initial, initial_end) = ctx.search(camera, 1, |f| ruler.sight(f))?;
    ctx.reporter.status(format!(
        "Marker {} found at ({:.1}, {:.1})",
        initial.id, initial_end.x, initial_end.y
    ));

    ctx.enter(MeasureState::AwaitingReposition);
    ctx.reporter.status("Move the probe, then confirm");
    if !acknowledger.wait_for_reposition(ctx.cancel) {
        return Err(CamcalError::Cancelled);
    }

    ctx.enter(MeasureState::SearchingMoved);
    ctx.reporter.status("Looking for the moved marker");
    let (moved, moved_end) = ctx.search(camera, 2, |f| ruler.sight(f))?;

    ctx.enter(MeasureState::Computing);
    Ok(MeasurementOutcome::Displacement(MeasurementRecord::new(
        initial,
        initial_end,
        moved,
        moved_end,
    )))
}

fn recalibrate(
    camera: &mut Camera,
    board: &mut dyn TargetDetector,
    solver: &SolverOptions,
    ctx: &Ctx<'_>,
) -> Result<MeasurementOutcome, CamcalError> {
    ctx.enter(MeasureState::SearchingInitial);
    ctx.reporter.status("Looking for the chessboard");
    let (obs, size) = ctx.search(camera, 1, |frame| {
        let size = ImageSize::new(frame.width as u32, frame.height as u32);
        Ok(board.observe(frame)?.map(|obs| (obs, size)))
    })?;
    // Device no longer needed while solving.
    camera.close();
    ctx.enter(MeasureState::Computing);
    let result = calibrate(&[obs], size, solver)?;
    Ok(MeasurementOutcome::Recalibration(Box::new(result)))
}

fn persist(
    outcome: MeasurementOutcome,
    config: &MeasureConfig,
    ctx: &Ctx<'_>,
) -> Result<MeasurementOutcome, CamcalError> {
    if ctx.cancel.is_cancelled() {
        return Err(CamcalError::Cancelled);
    }
    if let Some(path) = &config.output_path {
        append_measurements(path, outcome.entries())?;
        ctx.reporter
            .status(format!("Measurement saved to {}", path.display()));
    }
    Ok(outcome)
}

/// A measurement running on its own thread.
pub struct MeasurementSession {
    pub state: Shared<MeasureState>,
    worker: Worker<Result<MeasurementOutcome, CamcalError>>,
}

impl MeasurementSession {
    /// Check the calibration and open the camera on the calling thread, then
    /// hand both to a worker.
    pub fn start(
        backend: &dyn CameraBackend,
        camera_index: usize,
        intrinsics: Option<Arc<Intrinsics>>,
        config: MeasureConfig,
        acknowledger: Arc<dyn Acknowledger>,
        reporter: Reporter,
    ) -> Result<Self, CamcalError> {
        let Some(intrinsics) = intrinsics else {
            reporter.status("Measurement needs a calibration; calibrate or load one first");
            return Err(CamcalError::NotCalibrated);
        };
        let mut camera = Camera::open(backend, camera_index).inspect_err(|e| {
            reporter.status(format!("Measurement not started: {e}"));
        })?;

        let state = Shared::new(MeasureState::Idle);
        let cancel = CancelToken::new();
        let worker = {
            let state = state.clone();
            let cancel = cancel.clone();
            Worker::spawn("camcal-measurement", cancel.clone(), move || {
                let out = run_measurement(
                    &mut camera,
                    Some(&intrinsics),
                    &config,
                    acknowledger.as_ref(),
                    &cancel,
                    &state,
                    &reporter,
                );
                camera.close();
                out
            })
        }
        .map_err(CamcalError::Spawn)?;
        info!("measurement started on camera {camera_index}");
        Ok(Self { state, worker })
    }

    pub fn state(&self) -> MeasureState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<Result<MeasurementOutcome, CamcalError>> {
        self.worker.wait(timeout)
    }

    pub fn cancel(&mut self, timeout: Duration) -> Option<Result<MeasurementOutcome, CamcalError>> {
        let joined = self.worker.cancel_and_join(timeout);
        if joined.is_none() && self.state().is_active() {
            self.state.set(MeasureState::Cancelled);
        }
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn observation(id: u32, corners: [(f64, f64); 4]) -> MarkerObservation {
        MarkerObservation {
            id,
            corners: corners.map(|(x, y)| Point2::new(x, y)),
            pose: None,
        }
    }

    #[test]
    fn end_point_steps_back_along_the_top_edge() {
        let end = ruler_end_point(Point2::new(0.0, 0.0), Point2::new(10.0, 0.0), 10.0, 5.0)
            .expect("end point");
        assert_relative_eq!(end, Point2::new(5.0, 0.0));

        // Edge of 20 px for a marker of 10 units: 2 px per unit.
        let end = ruler_end_point(Point2::new(0.0, 0.0), Point2::new(0.0, 20.0), 10.0, 3.0)
            .expect("end point");
        assert_relative_eq!(end, Point2::new(0.0, 14.0));
    }

    #[test]
    fn degenerate_edges_have_no_end_point() {
        let p = Point2::new(4.0, 4.0);
        assert!(ruler_end_point(p, p, 10.0, 1.0).is_none());
        assert!(ruler_end_point(p, Point2::new(5.0, 4.0), 0.0, 1.0).is_none());
    }

    #[test]
    fn distance_is_euclidean() {
        assert_relative_eq!(distance(Point2::new(5.0, 0.0), Point2::new(5.0, 3.0)), 3.0);
    }

    #[test]
    fn record_computes_distance() {
        let a = observation(1, [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        let b = observation(1, [(3.0, 4.0), (13.0, 4.0), (13.0, 14.0), (3.0, 14.0)]);
        let r = MeasurementRecord::new(a, Point2::new(5.0, 0.0), b, Point2::new(8.0, 4.0));
        assert_relative_eq!(r.distance, 5.0);
    }

    #[test]
    fn measurement_document_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("measurements.xml");
        let marker = observation(7, [(1.0, 2.0), (11.0, 2.0), (11.0, 12.0), (1.0, 12.0)]);
        let first = vec![
            MeasurementEntry::InitialMarker(XmlMarker::from(&marker)),
            MeasurementEntry::Distance(2.5),
        ];
        append_measurements(&path, first.clone()).expect("create");
        append_measurements(&path, vec![MeasurementEntry::Distance(4.0)]).expect("append");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("<?xml"));
        assert!(text.contains("<MeasurementData>"));
        assert!(text.contains(r#"<InitialMarker ID="7">"#));

        let entries = read_measurements(&path).expect("parse");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[..2], first[..]);
        assert_eq!(entries[2], MeasurementEntry::Distance(4.0));
    }

    #[test]
    fn unreadable_document_is_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("measurements.xml");
        fs::write(&path, "<MeasurementData><Bogus/>").expect("write");
        let err = append_measurements(&path, vec![MeasurementEntry::Distance(1.0)]).unwrap_err();
        assert!(matches!(err, CamcalError::MalformedPersistedData { .. }));
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "<MeasurementData><Bogus/>"
        );
    }

    #[test]
    fn immediate_acknowledger_respects_cancel() {
        let cancel = CancelToken::new();
        assert!(ImmediateAcknowledger.wait_for_reposition(&cancel));
        cancel.cancel();
        assert!(!ImmediateAcknowledger.wait_for_reposition(&cancel));
    }

    #[test]
    fn channel_acknowledger_waits_for_handle() {
        let (ack, handle) = ChannelAcknowledger::new();
        let cancel = CancelToken::new();
        assert!(handle.acknowledge());
        assert!(ack.wait_for_reposition(&cancel));

        let waiter = cancel.clone();
        let t = std::thread::spawn(move || ack.wait_for_reposition(&waiter));
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        assert!(!t.join().expect("join"));
    }

    #[test]
    fn with_offset_only_touches_displacement() {
        let c = MeasureConfig::marker_displacement(1.0, 0.05).with_offset(3.0);
        assert_eq!(
            c.strategy,
            MeasurementStrategy::MarkerDisplacement {
                offset: 3.0,
                marker_length: 0.05
            }
        );
        let r = MeasureConfig {
            strategy: MeasurementStrategy::ChessboardRecalibration { square_size: 1.0 },
            ..MeasureConfig::default()
        }
        .with_offset(3.0);
        assert_eq!(
            r.strategy,
            MeasurementStrategy::ChessboardRecalibration { square_size: 1.0 }
        );
    }
}
