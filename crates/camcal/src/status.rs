//! Status reporting towards the presentation layer.

use crate::state::{MeasureState, SessionState};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Structured progress, emitted alongside the human-readable messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    CalibrationState(SessionState),
    MeasurementState(MeasureState),
    /// Target not found in a frame while looking for `shot`.
    DetectionMissed { shot: u32, attempt: u32 },
    ShotAccepted { shot: u32, total: u32 },
    Calibrated { rms_error: f64 },
    Measured { distance: f64 },
    LiveView { running: bool },
}

/// Receives status from worker threads. Implementations must not block.
pub trait StatusSink: Send + Sync {
    fn status(&self, message: &str);

    fn event(&self, event: &SessionEvent) {
        let _ = event;
    }
}

/// Forwards everything to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn status(&self, message: &str) {
        info!("{message}");
    }

    fn event(&self, event: &SessionEvent) {
        debug!("{event:?}");
    }
}

/// Keeps every message and event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StatusSink for RecordingSink {
    fn status(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }

    fn event(&self, event: &SessionEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Cloneable handle used by workers: logs and forwards to the sink.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn StatusSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    pub fn status(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("status: {message}");
        self.sink.status(message);
    }

    pub fn event(&self, event: SessionEvent) {
        self.sink.event(&event);
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Reporter")
    }
}
