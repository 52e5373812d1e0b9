mod common;

use camcal::camera::{Camera, MemoryBackend};
use camcal::detect::TargetDetector;
use camcal::session::{run_calibration, CalibrationSession, SessionConfig, SessionTracker};
use camcal::intrinsics::SolverError;
use camcal::worker::CancelToken;
use camcal::{CamcalError, Progress, SessionEvent, SessionState};
use common::{recorder, tagged_stream, SyntheticBoard, MISS};
use std::path::PathBuf;
use std::time::Duration;

fn config(shots: u32, output: Option<PathBuf>) -> SessionConfig {
    SessionConfig {
        num_shots: shots,
        output_path: output,
        ..SessionConfig::chessboard_5().without_delays()
    }
}

fn run(
    frames: &[u8],
    detector: &mut dyn TargetDetector,
    config: &SessionConfig,
    cancel: &CancelToken,
) -> (Result<camcal::CalibrationOutcome, CamcalError>, SessionTracker, Vec<SessionEvent>, Vec<String>) {
    let backend = MemoryBackend::new().with_device(tagged_stream(frames));
    let mut camera = Camera::open(&backend, 0).expect("device");
    let tracker = SessionTracker::new();
    let (reporter, sink) = recorder();
    let out = run_calibration(&mut camera, detector, config, cancel, &tracker, &reporter);
    (out, tracker, sink.events(), sink.messages())
}

#[test]
fn solves_after_exactly_n_accepted_shots() {
    common::init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("calib.xml");
    let cfg = config(3, Some(path.clone()));
    let (out, tracker, events, messages) = run(
        &[MISS, 0, MISS, MISS, 1, 2, 3, 4],
        &mut SyntheticBoard::new(),
        &cfg,
        &CancelToken::new(),
    );

    let outcome = out.expect("calibrated");
    assert_eq!(tracker.state.get(), SessionState::Completed);
    assert_eq!(tracker.progress.get(), Progress { accepted: 3, total: 3 });
    assert_eq!(outcome.saved_to.as_deref(), Some(path.as_path()));
    assert!(path.exists());
    assert!(tracker.calibration.is_set());

    let accepted: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ShotAccepted { .. }))
        .collect();
    assert_eq!(accepted.len(), 3);
    let missed = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::DetectionMissed { .. }))
        .count();
    assert_eq!(missed, 3);

    // Solving is entered once, after the last acceptance.
    let solving = events
        .iter()
        .position(|e| *e == SessionEvent::CalibrationState(SessionState::Solving))
        .expect("solving");
    let last_accept = events
        .iter()
        .rposition(|e| matches!(e, SessionEvent::ShotAccepted { .. }))
        .expect("accepted");
    assert!(solving > last_accept);

    assert!(messages.iter().any(|m| m == "Shot 3 of 3 accepted"));
    assert!(messages.iter().any(|m| m.contains("not detected, retrying")));
}

#[test]
fn cancelling_at_any_count_writes_nothing() {
    let n = 3;
    // k == n cancels after the last acceptance, before anything is solved or saved.
    for k in 0..=n {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calib.xml");
        let cancel = CancelToken::new();
        let mut board = SyntheticBoard::cancelling_after(k, cancel.clone());
        let (out, tracker, _, messages) = run(
            &[0, 1, 2, 3, 4],
            &mut board,
            &config(n as u32, Some(path.clone())),
            &cancel,
        );

        assert!(matches!(out, Err(CamcalError::Cancelled)), "k = {k}");
        assert_eq!(tracker.state.get(), SessionState::Cancelled);
        assert_eq!(tracker.progress.get().accepted, k as u32);
        assert!(!path.exists(), "k = {k}");
        assert!(!tracker.calibration.is_set());
        assert!(messages.iter().any(|m| m == "Calibration cancelled"));
    }
}

#[test]
fn zero_shots_fail_in_the_solver() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("calib.xml");
    let (out, tracker, events, messages) = run(
        &[0, 1, 2],
        &mut SyntheticBoard::new(),
        &config(0, Some(path.clone())),
        &CancelToken::new(),
    );

    assert!(matches!(
        out,
        Err(CamcalError::SolverFailure(SolverError::NoObservations))
    ));
    assert_eq!(tracker.state.get(), SessionState::Failed);
    assert_eq!(tracker.progress.get(), Progress { accepted: 0, total: 0 });
    assert!(events.contains(&SessionEvent::CalibrationState(SessionState::Solving)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::ShotAccepted { .. })));
    assert!(!path.exists());
    assert!(!tracker.calibration.is_set());
    assert!(messages.iter().any(|m| m.starts_with("Calibration failed")));
}

#[test]
fn attempt_cap_fails_the_session() {
    let cfg = SessionConfig {
        max_attempts_per_shot: Some(2),
        ..config(2, None)
    };
    let (out, tracker, _, _) = run(
        &[0, MISS, MISS, MISS],
        &mut SyntheticBoard::new(),
        &cfg,
        &CancelToken::new(),
    );
    assert!(matches!(
        out,
        Err(CamcalError::AttemptLimit {
            shot: 2,
            attempts: 2
        })
    ));
    assert_eq!(tracker.state.get(), SessionState::Failed);
    assert_eq!(tracker.progress.get().accepted, 1);
}

#[test]
fn empty_read_fails_without_consuming_shots() {
    let (out, tracker, _, messages) = run(
        &[],
        &mut SyntheticBoard::new(),
        &config(2, None),
        &CancelToken::new(),
    );
    assert!(matches!(out, Err(CamcalError::FrameReadFailure { reads: 1 })));
    assert_eq!(tracker.state.get(), SessionState::Failed);
    assert_eq!(tracker.progress.get(), Progress { accepted: 0, total: 2 });
    assert!(messages.iter().any(|m| m.starts_with("Calibration failed")));
}

#[test]
fn stream_ending_mid_session_is_a_read_failure() {
    let cfg = SessionConfig {
        max_empty_reads: 3,
        ..config(3, None)
    };
    let (out, tracker, _, _) = run(&[0, 1], &mut SyntheticBoard::new(), &cfg, &CancelToken::new());
    assert!(matches!(out, Err(CamcalError::FrameReadFailure { reads: 3 })));
    assert_eq!(tracker.progress.get().accepted, 2);
}

#[test]
fn unavailable_device_starts_no_worker() {
    let backend = MemoryBackend::new().with_missing_device();
    let (reporter, sink) = recorder();
    let started = CalibrationSession::start(
        &backend,
        0,
        config(2, None),
        SessionTracker::new(),
        reporter,
    );
    assert!(matches!(
        started,
        Err(CamcalError::DeviceUnavailable { index: 0, .. })
    ));
    assert_eq!(backend.open_sources(), 0);
    assert!(sink
        .events()
        .iter()
        .all(|e| *e != SessionEvent::CalibrationState(SessionState::Capturing)));
}

#[test]
fn background_session_can_be_cancelled() {
    // A blank looping stream keeps the chessboard detector searching.
    let backend = MemoryBackend::new().with_looping_device(
        vec![camcal::core::GrayImage::filled(64, 48, 200)],
        Duration::from_millis(2),
    );
    let (reporter, _) = recorder();
    let tracker = SessionTracker::new();
    let mut session = CalibrationSession::start(
        &backend,
        0,
        config(2, None),
        tracker.clone(),
        reporter,
    )
    .expect("started");
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while session.state() != SessionState::Searching && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(session.state(), SessionState::Searching);

    let joined = session.cancel(Duration::from_secs(2));
    assert!(matches!(joined, Some(Err(CamcalError::Cancelled))));
    assert_eq!(tracker.state.get(), SessionState::Cancelled);
    assert!(session.is_finished());
    assert_eq!(backend.open_sources(), 0);
}
