//! Control surface for a presentation layer.
//!
//! The camera is exclusive: starting one activity tears down whichever other
//! activity is running, while starting the same activity twice is refused.

use crate::camera::{Camera, CameraBackend, Frame};
use crate::error::CamcalError;
use crate::measure::{Acknowledger, ImmediateAcknowledger, MeasureConfig, MeasurementOutcome, MeasurementSession};
use crate::session::{CalibrationOutcome, CalibrationSession, SessionConfig, SessionTracker};
use crate::state::{
    CalibrationSlot, ControlState, ControllerState, MeasureState, Progress, SessionState, Shared,
};
use crate::status::{LogSink, Reporter, SessionEvent, StatusSink};
use crate::worker::{CancelToken, Worker};
use camcal_intrinsics::{store, Intrinsics, UndistortMap};
use log::{debug, info};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CALIBRATION: &str = "calibration";
const MEASUREMENT: &str = "measurement";
const LIVE_VIEW: &str = "live view";

/// Undistorts frames with a map cached per calibration and frame size.
#[derive(Debug, Default)]
pub struct FrameProcessor {
    cached: Option<(Arc<Intrinsics>, UndistortMap)>,
}

impl FrameProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Undistorted copy of `frame` when a calibration is given, else a plain copy.
    pub fn process(
        &mut self,
        frame: &Frame,
        calibration: Option<&Arc<Intrinsics>>,
    ) -> Result<Frame, CamcalError> {
        let Some(k) = calibration else {
            return Ok(frame.clone());
        };
        let view = frame.view();
        view.validate().map_err(crate::detect::DetectError::from)?;
        let stale = self.cached.as_ref().is_none_or(|(cached, map)| {
            !Arc::ptr_eq(cached, k) || map.width() != frame.width || map.height() != frame.height
        });
        if stale {
            debug!("building undistort map for {}x{}", frame.width, frame.height);
            self.cached = Some((Arc::clone(k), UndistortMap::new(k, frame.width, frame.height)));
        }
        match &self.cached {
            Some((_, map)) => Ok(map.remap(&view)?),
            None => Ok(frame.clone()),
        }
    }
}

struct LiveView {
    latest: Shared<Option<Arc<Frame>>>,
    worker: Worker<()>,
}

/// Owns every activity and the calibration in effect.
pub struct Controller {
    backend: Arc<dyn CameraBackend>,
    reporter: Reporter,
    session_config: SessionConfig,
    measure_config: MeasureConfig,
    acknowledger: Arc<dyn Acknowledger>,
    join_timeout: Duration,

    calibration: CalibrationSlot,
    applied: Arc<AtomicBool>,
    processor: FrameProcessor,

    calibrating: Option<CalibrationSession>,
    measuring: Option<MeasurementSession>,
    live: Option<LiveView>,
}

impl Controller {
    pub fn new(backend: Arc<dyn CameraBackend>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            backend,
            reporter: Reporter::new(sink),
            session_config: SessionConfig::default(),
            measure_config: MeasureConfig::default(),
            acknowledger: Arc::new(ImmediateAcknowledger),
            join_timeout: Duration::from_secs(1),
            calibration: CalibrationSlot::new(),
            applied: Arc::new(AtomicBool::new(false)),
            processor: FrameProcessor::new(),
            calibrating: None,
            measuring: None,
            live: None,
        }
    }

    /// Controller reporting through the `log` facade only.
    pub fn with_log_sink(backend: Arc<dyn CameraBackend>) -> Self {
        Self::new(backend, Arc::new(LogSink))
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_measure_config(mut self, config: MeasureConfig) -> Self {
        self.measure_config = config;
        self
    }

    pub fn with_acknowledger(mut self, acknowledger: Arc<dyn Acknowledger>) -> Self {
        self.acknowledger = acknowledger;
        self
    }

    /// Longest wait for a cancelled worker before it is detached.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn set_session_config(&mut self, config: SessionConfig) {
        self.session_config = config;
    }

    fn calibration_state(&self) -> SessionState {
        self.calibrating
            .as_ref()
            .map_or(SessionState::Idle, CalibrationSession::state)
    }

    fn measurement_state(&self) -> MeasureState {
        self.measuring
            .as_ref()
            .map_or(MeasureState::Idle, MeasurementSession::state)
    }

    fn live_view_running(&self) -> bool {
        self.live.as_ref().is_some_and(|l| !l.worker.is_finished())
    }

    pub fn state(&self) -> ControllerState {
        ControllerState {
            calibration: self.calibration_state(),
            measurement: self.measurement_state(),
            live_view: self.live_view_running(),
            calibrated: self.calibration.is_set(),
            applied: self.applied.load(Ordering::SeqCst),
        }
    }

    pub fn controls(&self) -> ControlState {
        self.state().controls()
    }

    pub fn progress(&self) -> Progress {
        self.calibrating
            .as_ref()
            .map_or_else(Progress::default, CalibrationSession::progress)
    }

    pub fn calibration(&self) -> Option<Arc<Intrinsics>> {
        self.calibration.get()
    }

    /// Start a calibration session on `camera_index`.
    ///
    /// Any measurement or live view is stopped first. When the device cannot
    /// be opened the controller stays idle and no worker is left behind.
    pub fn start_calibration(&mut self, camera_index: usize) -> Result<(), CamcalError> {
        if self.calibration_state().is_active() {
            self.reporter.status("Calibration already running");
            return Err(CamcalError::AlreadyRunning {
                activity: CALIBRATION,
            });
        }
        self.stop_measurement_worker();
        self.stop_live_view_worker();
        self.calibrating = None;

        let session = CalibrationSession::start(
            self.backend.as_ref(),
            camera_index,
            self.session_config.clone(),
            SessionTracker::with_slot(self.calibration.clone()),
            self.reporter.clone(),
        )?;
        self.calibrating = Some(session);
        Ok(())
    }

    /// `true` when a running session was stopped.
    pub fn cancel_calibration(&mut self) -> bool {
        let Some(session) = self.calibrating.as_mut() else {
            return false;
        };
        if !session.state().is_active() {
            return false;
        }
        session.cancel(self.join_timeout);
        true
    }

    /// Forget the calibration and return to `Idle`.
    pub fn reset_calibration(&mut self) {
        self.cancel_calibration();
        self.calibrating = None;
        self.calibration.set(None);
        self.set_applied(false);
        self.reporter.status("Calibration reset");
    }

    /// Toggle undistortion of the live view. Enabling needs a calibration.
    pub fn apply_calibration(&mut self, apply: bool) -> Result<(), CamcalError> {
        if apply && !self.calibration.is_set() {
            self.reporter.status("No calibration to apply");
            return Err(CamcalError::NotCalibrated);
        }
        self.set_applied(apply);
        self.reporter.status(if apply {
            "Calibration applied to live view"
        } else {
            "Calibration no longer applied"
        });
        Ok(())
    }

    fn set_applied(&self, apply: bool) {
        self.applied.store(apply, Ordering::SeqCst);
    }

    /// Start a measurement with the configured strategy and `offset`.
    pub fn start_measurement(&mut self, camera_index: usize, offset: f64) -> Result<(), CamcalError> {
        if self.measurement_state().is_active() {
            self.reporter.status("Measurement already running");
            return Err(CamcalError::AlreadyRunning {
                activity: MEASUREMENT,
            });
        }
        let Some(intrinsics) = self.calibration.get() else {
            self.reporter
                .status("Measurement needs a calibration; calibrate or load one first");
            return Err(CamcalError::NotCalibrated);
        };
        self.cancel_calibration();
        self.stop_live_view_worker();
        self.measuring = None;

        let session = MeasurementSession::start(
            self.backend.as_ref(),
            camera_index,
            Some(intrinsics),
            self.measure_config.clone().with_offset(offset),
            Arc::clone(&self.acknowledger),
            self.reporter.clone(),
        )?;
        self.measuring = Some(session);
        Ok(())
    }

    pub fn cancel_measurement(&mut self) -> bool {
        let Some(session) = self.measuring.as_mut() else {
            return false;
        };
        if !session.state().is_active() {
            return false;
        }
        session.cancel(self.join_timeout);
        true
    }

    fn stop_measurement_worker(&mut self) {
        if self.cancel_measurement() {
            info!("measurement stopped to free the camera");
        }
    }

    /// Replace the calibration with the one stored at `path` and apply it.
    pub fn load_calibration(&mut self, path: impl AsRef<Path>) -> Result<(), CamcalError> {
        let path = path.as_ref();
        if self.calibration_state().is_active() {
            return Err(CamcalError::AlreadyRunning {
                activity: CALIBRATION,
            });
        }
        let intrinsics = store::load(path).inspect_err(|e| {
            self.reporter.status(format!("Loading calibration failed: {e}"));
        })?;
        self.calibration.set(Some(Arc::new(intrinsics)));
        self.set_applied(true);
        self.reporter
            .status(format!("Calibration loaded from {}", path.display()));
        Ok(())
    }

    pub fn save_calibration(&self, path: impl AsRef<Path>) -> Result<(), CamcalError> {
        let path = path.as_ref();
        let Some(intrinsics) = self.calibration.get() else {
            self.reporter.status("No calibration to save");
            return Err(CamcalError::NotCalibrated);
        };
        store::save(&intrinsics, path).inspect_err(|e| {
            self.reporter.status(format!("Saving calibration failed: {e}"));
        })?;
        self.reporter
            .status(format!("Calibration saved to {}", path.display()));
        Ok(())
    }

    /// Stream frames from `camera_index` into [`Controller::latest_frame`],
    /// undistorted while a calibration is applied.
    pub fn start_live_view(&mut self, camera_index: usize) -> Result<(), CamcalError> {
        if self.live_view_running() {
            return Err(CamcalError::AlreadyRunning {
                activity: LIVE_VIEW,
            });
        }
        self.cancel_calibration();
        self.stop_measurement_worker();
        self.live = None;

        let mut camera = Camera::open(self.backend.as_ref(), camera_index).inspect_err(|e| {
            self.reporter.status(format!("Live view not started: {e}"));
        })?;
        let latest = Shared::new(None);
        let cancel = CancelToken::new();
        let worker = {
            let latest = latest.clone();
            let token = cancel.clone();
            let calibration = self.calibration.clone();
            let applied = Arc::clone(&self.applied);
            let reporter = self.reporter.clone();
            Worker::spawn("camcal-live-view", cancel, move || {
                let mut processor = FrameProcessor::new();
                reporter.event(SessionEvent::LiveView { running: true });
                while !token.is_cancelled() {
                    let Some(frame) = camera.read_frame() else {
                        reporter.status("Live view stopped: camera returned no frame");
                        break;
                    };
                    let k = calibration.get().filter(|_| applied.load(Ordering::SeqCst));
                    match processor.process(&frame, k.as_ref()) {
                        Ok(out) => latest.set(Some(Arc::new(out))),
                        Err(e) => {
                            reporter.status(format!("Live view stopped: {e}"));
                            break;
                        }
                    }
                }
                camera.close();
                reporter.event(SessionEvent::LiveView { running: false });
            })
        }
        .map_err(CamcalError::Spawn)?;
        self.live = Some(LiveView { latest, worker });
        Ok(())
    }

    /// `true` when a running live view was stopped.
    pub fn stop_live_view(&mut self) -> bool {
        let running = self.live_view_running();
        self.stop_live_view_worker();
        running
    }

    fn stop_live_view_worker(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.worker.cancel_and_join(self.join_timeout);
        }
    }

    /// Most recent live-view frame.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.live.as_ref().and_then(|l| l.latest.get())
    }

    /// Pass one frame through the same path as the live view.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Frame, CamcalError> {
        let k = self
            .calibration
            .get()
            .filter(|_| self.applied.load(Ordering::SeqCst));
        self.processor.process(frame, k.as_ref())
    }

    /// Block until the calibration session ends on its own.
    pub fn wait_calibration(
        &mut self,
        timeout: Option<Duration>,
    ) -> Option<Result<CalibrationOutcome, CamcalError>> {
        self.calibrating.as_mut()?.wait(timeout)
    }

    pub fn wait_measurement(
        &mut self,
        timeout: Option<Duration>,
    ) -> Option<Result<MeasurementOutcome, CamcalError>> {
        self.measuring.as_mut()?.wait(timeout)
    }

    /// Cancel everything that is running.
    pub fn shutdown(&mut self) {
        self.cancel_calibration();
        self.cancel_measurement();
        self.stop_live_view_worker();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::MemoryBackend;
    use crate::status::RecordingSink;
    use camcal_core::GrayImage;
    use camcal_intrinsics::Distortion;

    fn gradient(width: usize, height: usize) -> Frame {
        let mut img = GrayImage::filled(width, height, 0);
        for y in 0..height {
            for x in 0..width {
                img.set(x, y, ((x * 7 + y * 3) % 256) as u8);
            }
        }
        img
    }

    fn controller(backend: MemoryBackend) -> (Controller, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (Controller::new(Arc::new(backend), sink.clone()), sink)
    }

    #[test]
    fn fresh_controller_is_idle_and_uncalibrated() {
        let (mut c, _) = controller(MemoryBackend::new());
        assert_eq!(c.state(), ControllerState::default());
        assert!(matches!(c.apply_calibration(true), Err(CamcalError::NotCalibrated)));
        assert!(matches!(c.save_calibration("unused.xml"), Err(CamcalError::NotCalibrated)));
        assert!(matches!(c.start_measurement(0, 1.0), Err(CamcalError::NotCalibrated)));
        assert!(!c.cancel_calibration());
        assert!(!c.cancel_measurement());
    }

    #[test]
    fn process_frame_passes_through_until_applied() {
        let (mut c, _) = controller(MemoryBackend::new());
        let frame = gradient(40, 30);
        assert_eq!(c.process_frame(&frame).expect("frame"), frame);

        let k = Intrinsics::new(
            40.0,
            40.0,
            19.5,
            14.5,
            Distortion {
                k1: -0.3,
                ..Distortion::default()
            },
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calib.xml");
        store::save(&k, &path).expect("save");
        c.load_calibration(&path).expect("load");
        assert!(c.state().calibrated && c.state().applied);
        assert_ne!(c.process_frame(&frame).expect("frame"), frame);

        c.apply_calibration(false).expect("toggle");
        assert_eq!(c.process_frame(&frame).expect("frame"), frame);

        c.reset_calibration();
        assert!(!c.state().calibrated && !c.state().applied);
    }

    #[test]
    fn live_view_streams_and_stops() {
        let frames = vec![gradient(16, 12), gradient(16, 12)];
        let backend = MemoryBackend::new()
            .with_looping_device(frames.clone(), Duration::from_millis(2));
        let (mut c, sink) = controller(backend.clone());
        c.start_live_view(0).expect("start");
        assert!(matches!(
            c.start_live_view(0),
            Err(CamcalError::AlreadyRunning { activity: LIVE_VIEW })
        ));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while c.latest_frame().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(c.latest_frame().as_deref(), Some(&frames[0]));
        assert!(c.stop_live_view());
        assert!(!c.state().live_view);
        assert_eq!(backend.open_sources(), 0);
        assert!(sink.events().contains(&SessionEvent::LiveView { running: true }));
    }

    #[test]
    fn missing_device_leaves_live_view_off() {
        let backend = MemoryBackend::new().with_missing_device();
        let (mut c, _) = controller(backend.clone());
        assert!(matches!(
            c.start_live_view(0),
            Err(CamcalError::DeviceUnavailable { index: 0, .. })
        ));
        assert!(!c.state().live_view);
        assert_eq!(backend.open_sources(), 0);
    }
}
