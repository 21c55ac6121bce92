//! Append-only block log collaborator interface.
//!
//! A [`LogStore`] owns durable storage for any number of logs and wires
//! peer connections into their replication streams. A [`Log`] is a handle
//! to one append-only, content-addressed log inside a store.
//!
//! Two length notions matter to the harness: `length` counts entries known
//! to exist (announcements from peers raise it, so it may include gaps),
//! while `contiguous_length` counts entries actually present without gaps
//! from the start. `byte_length` in [`LogInfo`] covers only entries this
//! instance holds.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::LogError;
use crate::key::{DiscoveryKey, PublicKey};
use crate::swarm::Connection;

/// Authoritative shape of a log as reported by its storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    /// Number of entries known to exist.
    pub length: u64,
    /// Total bytes of entries this instance holds.
    pub byte_length: u64,
}

/// Change notification emitted by a log.
///
/// Events are delivered in the order the storage layer emits them. A
/// receiver that falls behind may observe a lagged stream; consumers that
/// enforce invariants should re-read the handle rather than trust event
/// payloads alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// The log's known length grew, locally or via a peer announcement.
    Append {
        /// The new known length.
        length: u64,
    },
    /// One block arrived via replication and was stored.
    Download {
        /// Index of the stored block.
        index: u64,
    },
}

/// Handle to one append-only log.
#[async_trait]
pub trait Log: Send + Sync {
    /// Public key identifying this log.
    fn key(&self) -> PublicKey;

    /// Discovery topic derived from the log key.
    fn discovery_key(&self) -> DiscoveryKey;

    /// Number of entries known to exist (may include gaps).
    fn length(&self) -> u64;

    /// Number of entries present without gaps from the start.
    fn contiguous_length(&self) -> u64;

    /// Append one block, returning its index.
    async fn append(&self, block: Bytes) -> Result<u64, LogError>;

    /// Register interest in blocks `start..end`; `None` means to the end
    /// of the log, including entries announced later.
    async fn download_range(&self, start: u64, end: Option<u64>) -> Result<(), LogError>;

    /// Authoritative length and byte length from the storage layer.
    async fn info(&self) -> Result<LogInfo, LogError>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;
}

/// Storage layer owning a set of logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open (or create) the writable log derived from a local name.
    async fn open_by_name(&self, name: &str) -> Result<Arc<dyn Log>, LogError>;

    /// Open a replica of the log identified by `key`.
    async fn open_by_key(&self, key: PublicKey) -> Result<Arc<dyn Log>, LogError>;

    /// Replicate every open log over `conn` for the connection's lifetime.
    fn replicate(&self, conn: Arc<dyn Connection>);

    /// Flush and close the store.
    async fn close(&self) -> Result<(), LogError>;
}
