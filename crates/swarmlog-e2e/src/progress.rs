//! Download progress reporting.
//!
//! Reporting is bounded: one report every Nth downloaded block regardless
//! of block size or total length, plus one unconditional final report when
//! the "fully downloaded" signal fires. Throughput is derived from block
//! count times the configured block size, which is exact for the fixed
//! block sizes this harness works with and an approximation otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use swarmlog_api::{Log, LogEvent};

use crate::state::HarnessState;

/// Default report cadence, in blocks.
pub const DEFAULT_REPORT_INTERVAL: u64 = 1000;

/// One progress observation.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    /// Blocks downloaded since the tracker started.
    pub blocks: u64,
    /// Approximate bytes downloaded.
    pub bytes: u64,
    /// Wall-clock time since the tracker started.
    pub elapsed: Duration,
    /// Average throughput over the whole run.
    pub bytes_per_sec: u64,
}

/// Cadence and throughput bookkeeping behind the tracker task.
#[derive(Debug)]
pub struct ProgressMeter {
    interval: u64,
    block_size_bytes: u64,
    started: Instant,
    blocks: u64,
}

impl ProgressMeter {
    /// Meter reporting every `interval` blocks.
    pub fn new(interval: u64, block_size_bytes: u64) -> Self {
        Self {
            interval: interval.max(1),
            block_size_bytes,
            started: Instant::now(),
            blocks: 0,
        }
    }

    /// Count one downloaded block; returns a report on cadence boundaries.
    pub fn on_block(&mut self) -> Option<ProgressReport> {
        self.blocks += 1;
        (self.blocks % self.interval == 0).then(|| self.report())
    }

    /// Account for blocks whose events were missed, e.g. on a lagged
    /// event stream. Approximate by nature.
    pub fn skip(&mut self, blocks: u64) {
        self.blocks += blocks;
    }

    /// Report for the current totals, regardless of cadence.
    pub fn report(&self) -> ProgressReport {
        let elapsed = self.started.elapsed();
        let bytes = self.blocks * self.block_size_bytes;
        let secs = elapsed.as_secs_f64();
        let bytes_per_sec = if secs > 0.0 { (bytes as f64 / secs) as u64 } else { 0 };
        ProgressReport { blocks: self.blocks, bytes, elapsed, bytes_per_sec }
    }

    /// Blocks counted so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

/// Render a duration as minutes and seconds.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m{:02}s", secs / 60, secs % 60)
}

/// Task reporting download progress for one log.
pub struct ProgressTracker;

impl ProgressTracker {
    /// Watch `log` until the completion signal fires or its event stream
    /// closes. Downloaded blocks are also counted into `state`.
    pub fn spawn(
        log: Arc<dyn Log>,
        block_size_bytes: u64,
        interval: u64,
        state: Arc<HarnessState>,
        mut completed: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = log.subscribe();
            let mut meter = ProgressMeter::new(interval, block_size_bytes);
            loop {
                tokio::select! {
                    changed = completed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *completed.borrow_and_update() {
                            emit(&meter.report());
                            info!(
                                elapsed = %format_duration(meter.report().elapsed),
                                blocks = meter.blocks(),
                                "download complete"
                            );
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(LogEvent::Download { .. }) => {
                            state.record_downloaded();
                            if let Some(report) = meter.on_block() {
                                emit(&report);
                            }
                        }
                        Ok(LogEvent::Append { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            meter.skip(skipped);
                            warn!(skipped, "progress event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

fn emit(report: &ProgressReport) {
    info!(
        blocks = report.blocks,
        downloaded = %ByteSize(report.bytes),
        elapsed = %format_duration(report.elapsed),
        throughput = %format!("{}/s", ByteSize(report.bytes_per_sec)),
        "download progress"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_every_nth_block() {
        let mut meter = ProgressMeter::new(1000, 64);
        let mut periodic = 0;
        for _ in 0..3500 {
            if meter.on_block().is_some() {
                periodic += 1;
            }
        }
        assert_eq!(periodic, 3);
        // The final report fires regardless of cadence alignment.
        let last = meter.report();
        assert_eq!(last.blocks, 3500);
        assert_eq!(last.bytes, 3500 * 64);
    }

    #[test]
    fn report_on_exact_boundary() {
        let mut meter = ProgressMeter::new(2, 1);
        assert!(meter.on_block().is_none());
        let report = meter.on_block().unwrap();
        assert_eq!(report.blocks, 2);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let mut meter = ProgressMeter::new(0, 1);
        assert!(meter.on_block().is_some());
    }

    #[test]
    fn skipped_blocks_count_toward_totals() {
        let mut meter = ProgressMeter::new(10, 4);
        meter.skip(7);
        assert_eq!(meter.blocks(), 7);
        assert_eq!(meter.report().bytes, 28);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0m00s");
        assert_eq!(format_duration(Duration::from_secs(59)), "0m59s");
        assert_eq!(format_duration(Duration::from_secs(272)), "4m32s");
    }
}
