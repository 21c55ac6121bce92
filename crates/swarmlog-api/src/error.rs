//! Error types for the collaborator boundary.

use thiserror::Error;

/// Key parsing/validation failures.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key material had the wrong number of bytes.
    #[error("key must be {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required byte count.
        expected: usize,
        /// Byte count actually supplied.
        actual: usize,
    },

    /// Key material was not valid hex.
    #[error("key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Log collaborator failures.
#[derive(Debug, Error)]
pub enum LogError {
    /// The store or log handle has been closed.
    #[error("log store is closed")]
    Closed,

    /// Append attempted on a log this instance cannot write.
    #[error("log {0} is not writable by this instance")]
    NotWritable(String),

    /// Backend storage failure.
    #[error("storage failed: {0}")]
    Storage(String),
}

/// Swarm collaborator failures.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The swarm has been shut down.
    #[error("swarm is shut down")]
    Closed,

    /// The peer connection has closed.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Metrics collaborator failures.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The client has been closed.
    #[error("metrics client is closed")]
    Closed,

    /// Registration with the scraper failed.
    #[error("metrics registration failed: {0}")]
    Registration(String),
}
