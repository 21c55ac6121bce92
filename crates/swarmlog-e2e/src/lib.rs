//! End-to-end test harness for swarmlog replication.
//!
//! Three roles cooperate around one logical log identified by a public
//! key: a creator originates and grows the log while serving it, a seeder
//! fully mirrors and re-serves it, and a downloader fetches it from
//! scratch into ephemeral storage and verifies it lands exactly as
//! expected. The harness exists to catch correctness and performance
//! regressions in the replication stack under realistic conditions.
//!
//! The core here is coordination: enforcing expected-size invariants
//! ([`invariant`]), bounded-rate progress reporting ([`progress`]), gating
//! the timed workload on external observation ([`readiness`]), and
//! failure-tolerant teardown in dependency order ([`shutdown`]). The
//! storage, swarm and metrics collaborators stay behind the
//! `swarmlog-api` traits and are injected into the role drivers
//! ([`roles`]).

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod invariant;
pub mod progress;
pub mod readiness;
pub mod roles;
pub mod shutdown;
pub mod state;

pub use config::{CreatorConfig, DownloaderConfig, ExpectedShape, SeederConfig};
pub use error::{ConfigError, FatalError, HarnessError};
pub use invariant::InvariantMonitor;
pub use progress::ProgressTracker;
pub use readiness::{MetricsReadiness, NoopReadiness, Readiness};
pub use roles::{run_creator, run_downloader, run_seeder, Backend, DownloaderBackend};
pub use shutdown::ShutdownCoordinator;
pub use state::{HarnessState, Phase};
