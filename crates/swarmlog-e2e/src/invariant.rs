//! Expected-shape invariant enforcement.
//!
//! The monitor watches one log's event stream and fails the run as soon as
//! the observed shape can no longer match the expected one: growth past
//! the expected length is fatal immediately, and a fully contiguous log
//! whose authoritative byte length differs from the derived expectation is
//! fatal too. A contiguous log whose byte length matches fires the
//! terminal "fully downloaded" signal, exactly once.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use swarmlog_api::{Log, LogEvent};

use crate::config::ExpectedShape;
use crate::error::FatalError;

/// Pure judgment logic behind the monitor task.
///
/// Tracks what has already been reported so a violation is raised at most
/// once and completion side effects cannot re-fire.
#[derive(Debug)]
pub struct ShapeChecker {
    expected: ExpectedShape,
    reported_fatal: bool,
    completed: bool,
}

impl ShapeChecker {
    /// Checker for one expected shape.
    pub fn new(expected: ExpectedShape) -> Self {
        Self { expected, reported_fatal: false, completed: false }
    }

    /// Judge a growth observation. Returns the violation the first time
    /// the length exceeds the bound, and never again after that.
    pub fn check_growth(&mut self, length: u64) -> Option<FatalError> {
        if self.reported_fatal || length <= self.expected.length {
            return None;
        }
        self.reported_fatal = true;
        Some(FatalError::UnexpectedGrowth { expected: self.expected.length, actual: length })
    }

    /// Whether a byte-length settlement should run now. False once the
    /// run has completed or failed, keeping completion idempotent.
    pub fn completion_due(&self, contiguous_length: u64) -> bool {
        !self.completed && !self.reported_fatal && contiguous_length == self.expected.length
    }

    /// Settle completion against the authoritative byte length.
    pub fn settle(&mut self, byte_length: u64) -> Result<(), FatalError> {
        if byte_length != self.expected.byte_length {
            self.reported_fatal = true;
            return Err(FatalError::ByteLengthMismatch {
                expected: self.expected.byte_length,
                actual: byte_length,
            });
        }
        self.completed = true;
        Ok(())
    }

    /// Whether a violation has been reported.
    pub fn is_fatal(&self) -> bool {
        self.reported_fatal
    }
}

enum Evaluate {
    Growth,
    Completion,
    Both,
}

/// Task enforcing the expected shape against a live log.
pub struct InvariantMonitor;

impl InvariantMonitor {
    /// Watch `log` until the run fails, completes and the stream ends, or
    /// the event stream closes. Violations go to `fatal`, the one-shot
    /// completion signal to `completed`.
    pub fn spawn(
        log: Arc<dyn Log>,
        expected: ExpectedShape,
        fatal: mpsc::Sender<FatalError>,
        completed: watch::Sender<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = log.subscribe();
            let mut checker = ShapeChecker::new(expected);

            // A log already at or past the target is judged immediately,
            // before any further event arrives.
            evaluate(&log, &mut checker, &fatal, &completed, Evaluate::Both).await;

            while !checker.is_fatal() {
                let evaluation = match events.recv().await {
                    Ok(LogEvent::Append { .. }) => {
                        info!(length = log.length(), "log updated");
                        Evaluate::Growth
                    }
                    Ok(LogEvent::Download { .. }) => Evaluate::Completion,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "log event stream lagged; re-evaluating from the handle");
                        Evaluate::Both
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                evaluate(&log, &mut checker, &fatal, &completed, evaluation).await;
            }
        })
    }
}

/// Judgments read the handle, not the event payloads, so a lagged stream
/// cannot produce a stale verdict.
async fn evaluate(
    log: &Arc<dyn Log>,
    checker: &mut ShapeChecker,
    fatal: &mpsc::Sender<FatalError>,
    completed: &watch::Sender<bool>,
    evaluation: Evaluate,
) {
    if matches!(evaluation, Evaluate::Growth | Evaluate::Both) {
        if let Some(violation) = checker.check_growth(log.length()) {
            error!(%violation, "expected-shape invariant violated");
            let _ = fatal.send(violation).await;
            return;
        }
    }
    if matches!(evaluation, Evaluate::Completion | Evaluate::Both)
        && checker.completion_due(log.contiguous_length())
    {
        match log.info().await {
            Ok(info) => match checker.settle(info.byte_length) {
                Ok(()) => {
                    info!(
                        length = info.length,
                        byte_length = info.byte_length,
                        "log fully downloaded"
                    );
                    let _ = completed.send(true);
                }
                Err(violation) => {
                    error!(%violation, "expected-shape invariant violated");
                    let _ = fatal.send(violation).await;
                }
            },
            Err(error) => warn!(%error, "failed to query authoritative log info"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use swarmlog_api::LogStore;
    use swarmlog_memory::MemoryLogStore;

    use super::*;

    fn shape() -> ExpectedShape {
        ExpectedShape::new(3, 16).unwrap()
    }

    #[test]
    fn growth_within_bound_is_fine() {
        let mut checker = ShapeChecker::new(shape());
        assert_eq!(checker.check_growth(1), None);
        assert_eq!(checker.check_growth(3), None);
        assert!(!checker.is_fatal());
    }

    #[test]
    fn growth_past_bound_is_fatal_exactly_once() {
        let mut checker = ShapeChecker::new(shape());
        assert_matches!(
            checker.check_growth(4),
            Some(FatalError::UnexpectedGrowth { expected: 3, actual: 4 })
        );
        // Repeat observations stay silent; the first report is terminal.
        assert_eq!(checker.check_growth(5), None);
        assert!(checker.is_fatal());
    }

    #[test]
    fn completion_fires_once() {
        let mut checker = ShapeChecker::new(shape());
        assert!(!checker.completion_due(2));
        assert!(checker.completion_due(3));
        checker.settle(48).unwrap();
        assert!(!checker.completion_due(3));
    }

    #[test]
    fn byte_length_mismatch_is_fatal_and_blocks_completion() {
        let mut checker = ShapeChecker::new(shape());
        assert!(checker.completion_due(3));
        assert_matches!(
            checker.settle(47),
            Err(FatalError::ByteLengthMismatch { expected: 48, actual: 47 })
        );
        assert!(checker.is_fatal());
        assert!(!checker.completion_due(3));
        assert_eq!(checker.check_growth(9), None);
    }

    #[tokio::test]
    async fn monitor_signals_completion_for_already_full_log() {
        let store = MemoryLogStore::new([1u8; 32]);
        let log = store.open_by_name("full").await.unwrap();
        for _ in 0..3 {
            log.append(Bytes::from(vec![0u8; 16])).await.unwrap();
        }

        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let (completed_tx, mut completed_rx) = watch::channel(false);
        InvariantMonitor::spawn(log, shape(), fatal_tx, completed_tx);

        tokio::time::timeout(Duration::from_secs(5), completed_rx.wait_for(|done| *done))
            .await
            .expect("completion signal")
            .expect("monitor alive");
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn monitor_reports_growth_past_bound() {
        let store = MemoryLogStore::new([1u8; 32]);
        let log = store.open_by_name("overgrown").await.unwrap();

        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let (completed_tx, _completed_rx) = watch::channel(false);
        InvariantMonitor::spawn(Arc::clone(&log), shape(), fatal_tx, completed_tx);

        for _ in 0..4 {
            log.append(Bytes::from(vec![0u8; 16])).await.unwrap();
        }

        let fatal = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .expect("fatal within deadline")
            .expect("fatal reported");
        assert_matches!(fatal, FatalError::UnexpectedGrowth { expected: 3, actual: 4 });
    }
}
