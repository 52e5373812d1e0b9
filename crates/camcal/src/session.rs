//! Calibration session: detect, accept or retry, accumulate, solve.

use crate::camera::{Camera, CameraBackend, Frame};
use crate::detect::{TargetConfig, TargetDetector};
use crate::error::CamcalError;
use crate::state::{CalibrationSlot, Progress, SessionState, Shared};
use crate::status::{Reporter, SessionEvent};
use crate::worker::{CancelToken, Worker};
use camcal_aruco::MarkerDetectorParams;
use camcal_chessboard::ChessboardParams;
use camcal_intrinsics::{
    calibrate, store, CalibrationResult, ImageSize, Intrinsics, Observation, SolverError,
    SolverOptions,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Everything a calibration session needs besides the camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub target: TargetConfig,
    pub num_shots: u32,
    /// Frames examined per shot before giving up; `None` retries forever.
    pub max_attempts_per_shot: Option<u32>,
    /// Consecutive empty reads tolerated before the session fails.
    pub max_empty_reads: u32,
    /// Pause before the first shot, for the operator to get ready.
    pub intro_delay_ms: u64,
    /// Pause after each accepted shot, for the operator to move the target.
    pub shot_delay_ms: u64,
    pub solver: SolverOptions,
    /// Where a successful calibration is written.
    pub output_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::chessboard_10()
    }
}

impl SessionConfig {
    fn chessboard(num_shots: u32) -> Self {
        Self {
            target: TargetConfig::Chessboard {
                params: ChessboardParams::default(),
                square_size: 1.0,
            },
            num_shots,
            max_attempts_per_shot: None,
            max_empty_reads: 1,
            intro_delay_ms: 2000,
            shot_delay_ms: 1000,
            solver: SolverOptions::default(),
            output_path: None,
        }
    }

    /// 9×6 inner corners, 10 shots.
    pub fn chessboard_10() -> Self {
        Self::chessboard(10)
    }

    /// 9×6 inner corners, 5 shots.
    pub fn chessboard_5() -> Self {
        Self::chessboard(5)
    }

    /// Single marker corners, 5 shots.
    pub fn marker_5() -> Self {
        Self {
            target: TargetConfig::Marker {
                params: MarkerDetectorParams::default(),
                marker_length: 0.02,
            },
            ..Self::chessboard(5)
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.replace('-', "_").as_str() {
            "chessboard_10" => Some(Self::chessboard_10()),
            "chessboard_5" => Some(Self::chessboard_5()),
            "marker_5" => Some(Self::marker_5()),
            _ => None,
        }
    }

    pub const PRESETS: &'static [&'static str] = &["chessboard_10", "chessboard_5", "marker_5"];

    /// Drop the operator pauses.
    pub fn without_delays(mut self) -> Self {
        self.intro_delay_ms = 0;
        self.shot_delay_ms = 0;
        self
    }
}

/// A finished calibration.
#[derive(Clone, Debug)]
pub struct CalibrationOutcome {
    pub intrinsics: Arc<Intrinsics>,
    pub result: CalibrationResult,
    pub saved_to: Option<PathBuf>,
}

/// State and progress of one session, readable while it runs. A completed
/// session publishes its intrinsics into `calibration` before it reports
/// `Completed`.
#[derive(Clone, Debug, Default)]
pub struct SessionTracker {
    pub state: Shared<SessionState>,
    pub progress: Shared<Progress>,
    pub calibration: CalibrationSlot,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish into an existing slot instead of a private one.
    pub fn with_slot(calibration: CalibrationSlot) -> Self {
        Self {
            calibration,
            ..Self::default()
        }
    }
}

struct Ctx<'a> {
    tracker: &'a SessionTracker,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
}

impl Ctx<'_> {
    fn enter(&self, state: SessionState) {
        self.tracker.state.set(state);
        self.reporter.event(SessionEvent::CalibrationState(state));
    }

    fn check_cancel(&self) -> Result<(), CamcalError> {
        if self.cancel.is_cancelled() {
            Err(CamcalError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn pause(&self, ms: u64) -> Result<(), CamcalError> {
        if self.cancel.sleep(Duration::from_millis(ms)) {
            Ok(())
        } else {
            Err(CamcalError::Cancelled)
        }
    }
}

/// Run a whole session on the calling thread.
///
/// Ends in `Completed`, `Failed` or `Cancelled`; a cancelled session
/// discards its observations and writes nothing.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(shots = config.num_shots)))]
pub fn run_calibration(
    camera: &mut Camera,
    detector: &mut dyn TargetDetector,
    config: &SessionConfig,
    cancel: &CancelToken,
    tracker: &SessionTracker,
    reporter: &Reporter,
) -> Result<CalibrationOutcome, CamcalError> {
    let ctx = Ctx {
        tracker,
        reporter,
        cancel,
    };
    let outcome = capture_and_solve(camera, detector, config, &ctx);
    match &outcome {
        Ok(out) => {
            ctx.enter(SessionState::Completed);
            reporter.event(SessionEvent::Calibrated {
                rms_error: out.result.rms_error,
            });
            reporter.status(format!(
                "Calibration completed, reprojection error {:.4} px",
                out.result.rms_error
            ));
        }
        Err(CamcalError::Cancelled) => {
            ctx.enter(SessionState::Cancelled);
            reporter.status("Calibration cancelled");
        }
        Err(e) => {
            ctx.enter(SessionState::Failed);
            reporter.status(format!("Calibration failed: {e}"));
        }
    }
    outcome
}

fn capture_and_solve(
    camera: &mut Camera,
    detector: &mut dyn TargetDetector,
    config: &SessionConfig,
    ctx: &Ctx<'_>,
) -> Result<CalibrationOutcome, CamcalError> {
    let total = config.num_shots;
    ctx.tracker.progress.set(Progress { accepted: 0, total });
    ctx.enter(SessionState::Capturing);
    ctx.reporter.status(format!(
        "Calibration started: {total} shots of the {} target",
        config.target.name()
    ));
    ctx.pause(config.intro_delay_ms)?;

    let mut observations: Vec<Observation> = Vec::with_capacity(total as usize);
    let mut image_size: Option<ImageSize> = None;

    for shot in 1..=total {
        ctx.enter(SessionState::Searching);
        ctx.reporter
            .status(format!("Shot {shot} of {total}: looking for the target"));
        let (obs, size) = acquire_shot(camera, detector, config, ctx, shot, image_size)?;
        image_size = Some(size);
        observations.push(obs);

        ctx.tracker.progress.set(Progress {
            accepted: shot,
            total,
        });
        ctx.enter(SessionState::Accepted);
        ctx.reporter.event(SessionEvent::ShotAccepted { shot, total });
        ctx.reporter.status(format!("Shot {shot} of {total} accepted"));
        if shot < total {
            ctx.pause(config.shot_delay_ms)?;
        }
    }

    ctx.check_cancel()?;
    // Device no longer needed while solving.
    camera.close();

    ctx.enter(SessionState::Solving);
    ctx.reporter
        .status(format!("Solving intrinsics from {} shots", observations.len()));
    // Zero shots leave nothing to solve from.
    let size = image_size.ok_or(SolverError::NoObservations)?;
    let result = calibrate(&observations, size, &config.solver)?;
    ctx.check_cancel()?;

    let intrinsics = Arc::new(result.intrinsics.clone());
    let saved_to = match &config.output_path {
        Some(path) => Some(persist(&intrinsics, path, ctx)?),
        None => None,
    };
    ctx.tracker.calibration.set(Some(Arc::clone(&intrinsics)));

    Ok(CalibrationOutcome {
        intrinsics,
        result,
        saved_to,
    })
}

/// Write the calibration unless the session was cancelled in the meantime.
fn persist(intrinsics: &Intrinsics, path: &Path, ctx: &Ctx<'_>) -> Result<PathBuf, CamcalError> {
    ctx.check_cancel()?;
    store::save(intrinsics, path)?;
    ctx.reporter
        .status(format!("Calibration saved to {}", path.display()));
    Ok(path.to_path_buf())
}

/// Read frames until the target is found in one of them.
fn acquire_shot(
    camera: &mut Camera,
    detector: &mut dyn TargetDetector,
    config: &SessionConfig,
    ctx: &Ctx<'_>,
    shot: u32,
    expected: Option<ImageSize>,
) -> Result<(Observation, ImageSize), CamcalError> {
    let mut attempts = 0u32;
    let mut empty = 0u32;
    loop {
        ctx.check_cancel()?;
        let Some(frame) = camera.read_frame() else {
            empty += 1;
            if empty >= config.max_empty_reads.max(1) {
                return Err(CamcalError::FrameReadFailure { reads: empty });
            }
            continue;
        };
        empty = 0;
        attempts += 1;

        if let Some(found) = try_frame(detector, &frame, expected)? {
            return Ok(found);
        }
        ctx.reporter.event(SessionEvent::DetectionMissed {
            shot,
            attempt: attempts,
        });
        match config.max_attempts_per_shot {
            Some(cap) if attempts >= cap => {
                return Err(CamcalError::AttemptLimit { shot, attempts });
            }
            Some(cap) => ctx.reporter.status(format!(
                "Shot {shot}: target not detected, retrying ({attempts}/{cap})"
            )),
            None => ctx
                .reporter
                .status(format!("Shot {shot}: target not detected, retrying")),
        }
    }
}

fn try_frame(
    detector: &mut dyn TargetDetector,
    frame: &Frame,
    expected: Option<ImageSize>,
) -> Result<Option<(Observation, ImageSize)>, CamcalError> {
    let size = ImageSize::new(frame.width as u32, frame.height as u32);
    if let Some(exp) = expected {
        if exp != size {
            warn!(
                "frame is {}x{}, session started at {}x{}; skipped",
                size.width, size.height, exp.width, exp.height
            );
            return Ok(None);
        }
    }
    Ok(detector.observe(frame)?.map(|obs| (obs, size)))
}

/// A calibration session running on its own thread.
pub struct CalibrationSession {
    pub tracker: SessionTracker,
    worker: Worker<Result<CalibrationOutcome, CamcalError>>,
}

impl CalibrationSession {
    /// Open the camera on the calling thread, then hand it to a worker.
    ///
    /// A device that fails to open is reported here and no worker starts.
    pub fn start(
        backend: &dyn CameraBackend,
        camera_index: usize,
        config: SessionConfig,
        tracker: SessionTracker,
        reporter: Reporter,
    ) -> Result<Self, CamcalError> {
        let mut detector = config.target.build()?;
        let mut camera = Camera::open(backend, camera_index).inspect_err(|e| {
            reporter.status(format!("Calibration not started: {e}"));
        })?;

        let cancel = CancelToken::new();
        let worker = {
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            Worker::spawn("camcal-calibration", cancel.clone(), move || {
                let out = run_calibration(
                    &mut camera,
                    detector.as_mut(),
                    &config,
                    &cancel,
                    &tracker,
                    &reporter,
                );
                camera.close();
                out
            })
        }
        .map_err(CamcalError::Spawn)?;
        info!("calibration session started on camera {camera_index}");
        Ok(Self { tracker, worker })
    }

    pub fn state(&self) -> SessionState {
        self.tracker.state.get()
    }

    pub fn progress(&self) -> Progress {
        self.tracker.progress.get()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Block until the session ends on its own.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<Result<CalibrationOutcome, CamcalError>> {
        self.worker.wait(timeout)
    }

    /// Cancel and join within `timeout`. A worker that misses the deadline is
    /// detached and the session is reported `Cancelled` regardless.
    pub fn cancel(&mut self, timeout: Duration) -> Option<Result<CalibrationOutcome, CamcalError>> {
        let joined = self.worker.cancel_and_join(timeout);
        if joined.is_none() && self.state().is_active() {
            self.tracker.state.set(SessionState::Cancelled);
        }
        joined
    }
}
