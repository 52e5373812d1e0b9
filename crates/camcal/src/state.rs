//! Activity states and the control availability derived from them.

use camcal_intrinsics::Intrinsics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Calibration session lifecycle.
///
/// `Idle → Capturing → (Searching ⇄ Accepted)* → Solving → Completed`,
/// with `Failed` and `Cancelled` reachable from any active state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Capturing,
    Searching,
    Accepted,
    Solving,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Capturing | Self::Searching | Self::Accepted | Self::Solving
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Searching => "searching",
            Self::Accepted => "accepted",
            Self::Solving => "solving",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Measurement session lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasureState {
    #[default]
    Idle,
    /// Looking for the target in its initial position.
    SearchingInitial,
    /// Waiting for the operator to move the probe.
    AwaitingReposition,
    SearchingMoved,
    Computing,
    Completed,
    Failed,
    Cancelled,
}

impl MeasureState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::SearchingInitial | Self::AwaitingReposition | Self::SearchingMoved | Self::Computing
        )
    }
}

impl fmt::Display for MeasureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::SearchingInitial => "searching (initial)",
            Self::AwaitingReposition => "awaiting reposition",
            Self::SearchingMoved => "searching (moved)",
            Self::Computing => "computing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Accepted shots out of the target count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub accepted: u32,
    pub total: u32,
}

/// Snapshot of everything the controls depend on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    pub calibration: SessionState,
    pub measurement: MeasureState,
    pub live_view: bool,
    pub calibrated: bool,
    pub applied: bool,
}

impl ControllerState {
    pub fn busy(&self) -> bool {
        self.calibration.is_active() || self.measurement.is_active()
    }

    pub fn controls(&self) -> ControlState {
        ControlState::derive(self)
    }
}

/// Which control operations are currently meaningful.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub start_calibration: bool,
    pub cancel_calibration: bool,
    pub reset_calibration: bool,
    pub apply_calibration: bool,
    pub start_measurement: bool,
    pub cancel_measurement: bool,
    pub load_calibration: bool,
    pub save_calibration: bool,
    pub start_live_view: bool,
    pub stop_live_view: bool,
}

impl ControlState {
    pub fn derive(s: &ControllerState) -> Self {
        let idle = !s.busy();
        Self {
            start_calibration: idle,
            cancel_calibration: s.calibration.is_active(),
            reset_calibration: idle && (s.calibrated || s.calibration.is_terminal()),
            apply_calibration: idle && s.calibrated,
            start_measurement: idle && s.calibrated,
            cancel_measurement: s.measurement.is_active(),
            load_calibration: idle,
            save_calibration: idle && s.calibrated,
            start_live_view: idle && !s.live_view,
            stop_live_view: s.live_view,
        }
    }
}

/// A value shared between a worker and its owner.
#[derive(Debug, Default)]
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> T {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, value: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// The calibration in effect. Replaced wholesale, never edited in place.
#[derive(Clone, Debug, Default)]
pub struct CalibrationSlot(Arc<RwLock<Option<Arc<Intrinsics>>>>);

impl CalibrationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Intrinsics>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, intrinsics: Option<Arc<Intrinsics>>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = intrinsics;
    }

    pub fn is_set(&self) -> bool {
        self.0.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_disables_everything_but_cancel() {
        let state = ControllerState {
            calibration: SessionState::Searching,
            calibrated: true,
            ..ControllerState::default()
        };
        assert_eq!(
            state.controls(),
            ControlState {
                cancel_calibration: true,
                ..ControlState::default()
            }
        );
    }

    #[test]
    fn measurement_needs_calibration() {
        let fresh = ControllerState::default().controls();
        assert!(fresh.start_calibration && fresh.load_calibration);
        assert!(!fresh.start_measurement && !fresh.save_calibration && !fresh.apply_calibration);
        assert!(!fresh.reset_calibration);

        let calibrated = ControllerState {
            calibration: SessionState::Completed,
            calibrated: true,
            ..ControllerState::default()
        }
        .controls();
        assert!(calibrated.start_measurement && calibrated.save_calibration);
        assert!(calibrated.reset_calibration && calibrated.apply_calibration);
    }

    #[test]
    fn measuring_allows_only_its_cancel() {
        let c = ControllerState {
            measurement: MeasureState::AwaitingReposition,
            calibrated: true,
            live_view: true,
            ..ControllerState::default()
        }
        .controls();
        assert!(c.cancel_measurement && c.stop_live_view);
        assert!(!c.start_calibration && !c.start_measurement && !c.load_calibration);
    }

    #[test]
    fn terminal_states_are_restartable() {
        for s in [SessionState::Completed, SessionState::Failed, SessionState::Cancelled] {
            assert!(s.is_terminal() && !s.is_active());
            let c = ControllerState {
                calibration: s,
                ..ControllerState::default()
            }
            .controls();
            assert!(c.start_calibration);
        }
    }

    #[test]
    fn shared_value_is_visible_through_clones() {
        let a = Shared::new(SessionState::Idle);
        let b = a.clone();
        b.set(SessionState::Solving);
        assert_eq!(a.get(), SessionState::Solving);
        a.update(|s| *s = SessionState::Completed);
        assert_eq!(b.get(), SessionState::Completed);
    }

    #[test]
    fn calibration_slot_swaps_whole_values() {
        use camcal_intrinsics::Distortion;
        let slot = CalibrationSlot::new();
        assert!(!slot.is_set());
        let k = Arc::new(Intrinsics::new(500.0, 500.0, 320.0, 240.0, Distortion::default()));
        slot.clone().set(Some(Arc::clone(&k)));
        assert!(slot.get().is_some_and(|got| Arc::ptr_eq(&got, &k)));
        slot.set(None);
        assert!(slot.get().is_none());
    }
}
