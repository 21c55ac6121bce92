//! Process-wide harness state.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Lifecycle phase of a harness run.
///
/// Transitions are monotonic; only the shutdown coordinator moves a run
/// into the last two phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Resources are being constructed.
    Created = 0,
    /// Waiting for the monitoring collaborator to observe this process.
    AwaitingReadiness = 1,
    /// The substantive workload is underway.
    Running = 2,
    /// Teardown has begun.
    ShuttingDown = 3,
    /// Teardown has finished.
    Terminated = 4,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::AwaitingReadiness,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

/// One instance per run, mutated by the components as events occur.
#[derive(Debug)]
pub struct HarnessState {
    phase: AtomicU8,
    connections: AtomicU64,
    blocks_downloaded: AtomicU64,
    started_at: OnceLock<Instant>,
}

impl Default for HarnessState {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessState {
    /// Fresh state in [`Phase::Created`].
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Created as u8),
            connections: AtomicU64::new(0),
            blocks_downloaded: AtomicU64::new(0),
            started_at: OnceLock::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Advance to `to`. Attempts to move backwards (or stand still) are
    /// logged and ignored; the resulting phase is returned either way.
    pub(crate) fn advance(&self, to: Phase) -> Phase {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if to as u8 <= current {
                warn!(current = ?Phase::from_u8(current), requested = ?to, "ignoring non-monotonic phase transition");
                return Phase::from_u8(current);
            }
            match self.phase.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return to,
                Err(actual) => current = actual,
            }
        }
    }

    /// Note a new peer connection; returns the new total.
    pub fn connection_opened(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Note a closed peer connection; returns the new total. The count
    /// never goes negative; an excess decrement is an accounting bug and
    /// is logged.
    pub fn connection_closed(&self) -> u64 {
        let mut current = self.connections.load(Ordering::Acquire);
        loop {
            if current == 0 {
                error!("connection count underflow; keeping it at zero");
                return 0;
            }
            match self.connections.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current peer connection total.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Count one downloaded block; returns the new total.
    pub fn record_downloaded(&self) -> u64 {
        self.blocks_downloaded.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Blocks downloaded so far.
    pub fn blocks_downloaded(&self) -> u64 {
        self.blocks_downloaded.load(Ordering::Acquire)
    }

    /// Record the start of the timed workload. First call wins.
    pub fn mark_started(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    /// Time since the workload started, if it has.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.get().map(Instant::elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        let state = HarnessState::new();
        assert_eq!(state.phase(), Phase::Created);
        assert_eq!(state.advance(Phase::AwaitingReadiness), Phase::AwaitingReadiness);
        assert_eq!(state.advance(Phase::Running), Phase::Running);
        // Backwards and repeated transitions are ignored.
        assert_eq!(state.advance(Phase::AwaitingReadiness), Phase::Running);
        assert_eq!(state.advance(Phase::Running), Phase::Running);
        assert_eq!(state.advance(Phase::ShuttingDown), Phase::ShuttingDown);
        assert_eq!(state.advance(Phase::Terminated), Phase::Terminated);
        assert_eq!(state.phase(), Phase::Terminated);
    }

    #[test]
    fn phases_may_be_skipped() {
        let state = HarnessState::new();
        assert_eq!(state.advance(Phase::ShuttingDown), Phase::ShuttingDown);
    }

    #[test]
    fn connection_count_never_goes_negative() {
        let state = HarnessState::new();
        assert_eq!(state.connection_opened(), 1);
        assert_eq!(state.connection_opened(), 2);
        assert_eq!(state.connection_closed(), 1);
        assert_eq!(state.connection_closed(), 0);
        assert_eq!(state.connection_closed(), 0);
        assert_eq!(state.connections(), 0);
    }

    #[test]
    fn downloads_accumulate() {
        let state = HarnessState::new();
        assert_eq!(state.record_downloaded(), 1);
        assert_eq!(state.record_downloaded(), 2);
        assert_eq!(state.blocks_downloaded(), 2);
    }

    #[test]
    fn start_time_is_set_once() {
        let state = HarnessState::new();
        assert!(state.elapsed().is_none());
        state.mark_started();
        let first = state.elapsed().unwrap();
        state.mark_started();
        assert!(state.elapsed().unwrap() >= first);
    }
}
