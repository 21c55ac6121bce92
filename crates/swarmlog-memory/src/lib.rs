//! In-process backend for the swarmlog e2e test harness.
//!
//! Implements the `swarmlog-api` collaborator traits entirely in memory:
//! a sparse block log with append/download events, a loopback swarm that
//! matches topic joiners into duplex in-process connections, a
//! block-exchange session that replicates logs across a connection, and a
//! loopback metrics client.
//!
//! The backend exists so the harness and its integration tests can run a
//! whole creator/seeder/downloader constellation inside one process with
//! deterministic storage. Production deployments inject their own
//! implementations of the same traits.

#![forbid(unsafe_code)]

pub mod connection;
pub mod log;
pub mod metrics;
pub mod network;
pub mod replicate;
pub mod swarm;

pub use connection::MemoryConnection;
pub use log::{MemoryLog, MemoryLogStore};
pub use metrics::LoopbackMetricsClient;
pub use network::MemoryNetwork;
pub use swarm::MemorySwarm;
