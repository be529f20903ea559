//! Clock Synchronizer
//!
//! Keeps a logical clock aligned with the master's clock. The master is the
//! time authority and never calibrates itself; the peer stores the master's
//! timestamp from the last `timeCalibration` message together with the local
//! time it was applied at, and reports
//!
//! ```text
//! now = master_time_at_sync + (local_now - local_time_at_sync)
//! ```
//!
//! The last calibration wins. There is no averaging and no latency
//! compensation.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Calibration state shared between the dispatch task and the read loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    /// Master timestamp from the last calibration
    pub master_time_at_sync: Option<DateTime<Utc>>,
    /// Local time at which that calibration was applied
    pub local_time_at_sync: Option<DateTime<Utc>>,
}

impl ClockState {
    fn offset_now(&self, local_now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.master_time_at_sync, self.local_time_at_sync) {
            (Some(master), Some(local)) => master + (local_now - local),
            _ => local_now,
        }
    }
}

/// Logical clock, cheap to clone; clones share one calibration cell
#[derive(Debug, Clone, Default)]
pub struct ClockSynchronizer {
    state: Arc<Mutex<ClockState>>,
}

impl ClockSynchronizer {
    /// Create an uncalibrated clock
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        // The cell only holds plain timestamps, so a poisoned guard is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current logical time
    pub fn now(&self) -> DateTime<Utc> {
        let state = self.lock();
        state.offset_now(Utc::now())
    }

    /// Calibrate against a master timestamp, replacing any earlier calibration
    pub fn set_master_time(&self, master_time: DateTime<Utc>) {
        let mut state = self.lock();
        let local_now = Utc::now();
        state.master_time_at_sync = Some(master_time);
        state.local_time_at_sync = Some(local_now);
        debug!(
            "Clock calibrated: master {} at local {} (offset {} ms)",
            master_time,
            local_now,
            (master_time - local_now).num_milliseconds()
        );
    }

    /// Whether a calibration has been applied
    pub fn is_calibrated(&self) -> bool {
        let state = self.lock();
        state.master_time_at_sync.is_some() && state.local_time_at_sync.is_some()
    }

    /// Snapshot of the calibration cell
    pub fn state(&self) -> ClockState {
        *self.lock()
    }

    /// Drop the calibration and fall back to the local clock
    pub fn reset(&self) {
        *self.lock() = ClockState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TOLERANCE_MS: i64 = 5;

    fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
        let diff = (actual - expected).num_milliseconds().abs();
        assert!(
            diff <= TOLERANCE_MS,
            "expected {} within {}ms, got {} ({}ms off)",
            expected,
            TOLERANCE_MS,
            actual,
            diff
        );
    }

    #[test]
    fn test_uncalibrated_returns_local_clock() {
        let clock = ClockSynchronizer::new();
        assert!(!clock.is_calibrated());
        assert_close(clock.now(), Utc::now());
    }

    #[test]
    fn test_offset_arithmetic() {
        let local_sync = Utc::now();
        let master = local_sync - Duration::hours(3);
        let state = ClockState {
            master_time_at_sync: Some(master),
            local_time_at_sync: Some(local_sync),
        };

        let later = local_sync + Duration::milliseconds(1500);
        assert_eq!(state.offset_now(later), master + Duration::milliseconds(1500));
    }

    #[test]
    fn test_calibrated_clock_tracks_master() {
        let clock = ClockSynchronizer::new();
        let master = Utc::now() + Duration::minutes(10);

        clock.set_master_time(master);
        assert!(clock.is_calibrated());

        let before = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(40));
        let now = clock.now();
        let local_sync = clock.state().local_time_at_sync.unwrap();

        assert_close(now, master + (Utc::now() - local_sync));
        assert!(now - master >= before - local_sync);
    }

    #[test]
    fn test_last_calibration_wins() {
        let clock = ClockSynchronizer::new();
        clock.set_master_time(Utc::now() - Duration::days(1));
        let second = Utc::now() + Duration::hours(2);
        clock.set_master_time(second);

        assert_eq!(clock.state().master_time_at_sync, Some(second));
        assert_close(clock.now(), second);
    }

    #[test]
    fn test_clones_share_calibration() {
        let clock = ClockSynchronizer::new();
        let reader = clock.clone();
        let master = Utc::now() - Duration::minutes(5);

        clock.set_master_time(master);
        assert_close(reader.now(), master);

        reader.reset();
        assert!(!clock.is_calibrated());
    }
}
