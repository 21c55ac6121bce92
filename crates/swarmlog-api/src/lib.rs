//! Collaborator interfaces for the swarmlog e2e test harness.
//!
//! The harness drives three external collaborators: an append-only block
//! log backed by durable storage, a topic-based discovery swarm that yields
//! peer connections, and an optional metrics client that registers the
//! process with a remote scraper. This crate defines those boundaries as
//! traits so the harness logic stays independent of any concrete storage or
//! networking backend.
//!
//! Concrete backends implement [`LogStore`], [`Swarm`] and [`MetricsClient`];
//! the `swarmlog-memory` crate provides the in-process backend used by the
//! integration tests and local runs.

#![forbid(unsafe_code)]

pub mod error;
pub mod key;
pub mod log;
pub mod metrics;
pub mod swarm;

pub use error::{KeyError, LogError, MetricsError, SwarmError};
pub use key::{DiscoveryKey, PublicKey, SecretKey};
pub use log::{Log, LogEvent, LogInfo, LogStore};
pub use metrics::{MetricsClient, MetricsConfig};
pub use swarm::{Connection, JoinOpts, PeerConnection, PeerInfo, Swarm};
