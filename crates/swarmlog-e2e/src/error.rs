//! Harness error taxonomy.
//!
//! Three classes matter: configuration errors (detected before any I/O,
//! never retried), fatal invariant violations (detected mid-run, never
//! retried, because the harness can no longer trust its observations), and
//! shutdown-step failures (logged and absorbed, see `shutdown`). Transient
//! network errors stay inside the collaborators.

use thiserror::Error;

use swarmlog_api::{KeyError, LogError, MetricsError, SwarmError};

/// Invalid or missing startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The role needs the log's public key.
    #[error("SWARMLOG_E2E_KEY must be set to the log's public key")]
    MissingKey,

    /// A key-valued variable did not hold a valid key.
    #[error("{var} must be set to a valid key: {source}")]
    InvalidKey {
        /// The offending variable.
        var: &'static str,
        /// Why it failed to parse.
        #[source]
        source: KeyError,
    },

    /// Seeder and downloader refuse to run without their sanity checks.
    #[error("{0} must be set, as a sanity check")]
    MissingSanityValue(&'static str),

    /// A numeric variable did not parse.
    #[error("{var} must be a non-negative integer: {source}")]
    InvalidNumber {
        /// The offending variable.
        var: &'static str,
        /// Why it failed to parse.
        #[source]
        source: std::num::ParseIntError,
    },

    /// Block size zero would make every byte-length check degenerate.
    #[error("block size must be greater than zero")]
    ZeroBlockSize,

    /// length × block size does not fit in 64 bits.
    #[error("expected byte length overflows: {length} blocks of {block_size_bytes} bytes")]
    ByteLengthOverflow {
        /// Configured entry count.
        length: u64,
        /// Configured block size.
        block_size_bytes: u64,
    },

    /// A metrics secret without a scraper key is unusable.
    #[error("SWARMLOG_E2E_METRICS_SCRAPER_KEY must be set whenever SWARMLOG_E2E_METRICS_SECRET is")]
    MissingScraperKey,
}

/// Conditions after which continued operation can no longer be trusted.
///
/// Always terminal: the process reports the violation once and exits
/// non-zero.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The log grew past the expected bound.
    #[error("log grew past the expected length of {expected} (current length: {actual})")]
    UnexpectedGrowth {
        /// Expected entry count.
        expected: u64,
        /// Observed entry count.
        actual: u64,
    },

    /// The fully downloaded log does not have the expected byte length.
    #[error("log does not have the expected byte length of {expected} (saw {actual})")]
    ByteLengthMismatch {
        /// Expected byte length.
        expected: u64,
        /// Authoritative byte length reported by the log.
        actual: u64,
    },

    /// A downloader's freshly created storage already held log data.
    #[error("storage is not fresh: log opened with length {length}")]
    StaleStorage {
        /// Length found at open time.
        length: u64,
    },

    /// The creator's own writes produced a different shape than intended.
    ///
    /// Kept distinct from the monitor-driven violations above: here the
    /// driver itself just performed the appends, so a mismatch is an
    /// internal logic error rather than an externally observed one.
    #[error("created log has unexpected {field}: expected {expected}, saw {actual}")]
    CreatorShapeMismatch {
        /// Which measurement diverged.
        field: &'static str,
        /// Expected value.
        expected: u64,
        /// Observed value.
        actual: u64,
    },
}

/// Any error a role driver can end with.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Startup configuration was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A fatal invariant violation was detected.
    #[error("fatal invariant violation: {0}")]
    Fatal(#[from] FatalError),

    /// The log collaborator failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The swarm collaborator failed.
    #[error(transparent)]
    Swarm(#[from] SwarmError),

    /// The metrics collaborator failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Filesystem failure while provisioning or removing storage.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
