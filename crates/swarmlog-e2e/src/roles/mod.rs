//! Role drivers composing the harness components.
//!
//! Each role is a linear sequence of phases with no re-entry: the creator
//! grows and serves the log, the seeder mirrors and re-serves it, the
//! downloader fetches it from scratch into ephemeral storage. All three
//! share the connection bridge that wires accepted peers into replication
//! and the shutdown registration discipline.

mod create;
mod download;
mod seed;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use create::run_creator;
pub use download::run_downloader;
pub use seed::run_seeder;

use swarmlog_api::{LogStore, MetricsClient, PeerConnection, Swarm};

use crate::error::{FatalError, HarnessError};
use crate::readiness::{readiness_for, Readiness};
use crate::shutdown::ShutdownCoordinator;
use crate::state::HarnessState;

/// Collaborators injected into the creator and seeder drivers.
pub struct Backend {
    /// Log storage layer.
    pub store: Arc<dyn LogStore>,
    /// Discovery swarm.
    pub swarm: Arc<dyn Swarm>,
    /// Metrics client, when monitoring is configured.
    pub metrics: Option<Arc<dyn MetricsClient>>,
}

/// Collaborators injected into the downloader driver, which provisions
/// its own ephemeral storage location and builds the store over it.
pub struct DownloaderBackend {
    /// Builds the store rooted at the ephemeral location.
    pub make_store: Box<dyn FnOnce(&std::path::Path) -> Arc<dyn LogStore> + Send>,
    /// Discovery swarm.
    pub swarm: Arc<dyn Swarm>,
    /// Metrics client, when monitoring is configured.
    pub metrics: Option<Arc<dyn MetricsClient>>,
}

pub(crate) const FATAL_CHANNEL_CAPACITY: usize = 4;
pub(crate) const GROW_LOG_INTERVAL: u64 = 10_000;

/// Await `operation` unless termination triggers first.
pub(crate) async fn unless_shutdown<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        value = operation => Some(value),
    }
}

/// Register the metrics client for teardown and build the readiness gate.
pub(crate) fn readiness_gate(
    shutdown: &ShutdownCoordinator,
    metrics: Option<Arc<dyn MetricsClient>>,
) -> Arc<dyn Readiness> {
    if let Some(client) = &metrics {
        info!("instrumenting");
        let client = Arc::clone(client);
        shutdown.register("metrics client", move || async move {
            client.close().await.map_err(HarnessError::from)
        });
    }
    readiness_for(metrics.as_ref())
}

/// The replication bridge: hand every accepted peer connection to the
/// store for the connection's lifetime, keeping the connection count and
/// logs honest.
pub(crate) fn spawn_connection_bridge(
    swarm: Arc<dyn Swarm>,
    store: Arc<dyn LogStore>,
    state: Arc<HarnessState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = swarm.accept() => accepted,
            };
            let Some(PeerConnection { connection, peer }) = accepted else {
                break;
            };
            let total = state.connection_opened();
            info!(
                peer = %peer.public_key.fmt_short(),
                address = %peer.address,
                total,
                "connected to peer"
            );
            store.replicate(Arc::clone(&connection));
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                connection.closed().await;
                let total = state.connection_closed();
                info!(
                    peer = %peer.public_key.fmt_short(),
                    address = %peer.address,
                    total,
                    "disconnected from peer"
                );
            });
        }
    })
}

/// Common driver tail: wait until termination or a fatal verdict, then
/// run the teardown sequence and surface the outcome.
pub(crate) async fn serve_until_shutdown(
    cancel: &CancellationToken,
    fatal_rx: &mut mpsc::Receiver<FatalError>,
) -> Result<(), HarnessError> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        fatal = fatal_rx.recv() => match fatal {
            Some(fatal) => Err(HarnessError::Fatal(fatal)),
            None => {
                // Nothing left to watch; wait out the run.
                cancel.cancelled().await;
                Ok(())
            }
        },
    }
}

/// Wrap a role body so teardown always runs, exactly once, whatever path
/// the body exits through.
pub(crate) async fn finish_role(
    shutdown: &ShutdownCoordinator,
    result: Result<(), HarnessError>,
) -> Result<(), HarnessError> {
    if let Err(error) = &result {
        error!(%error, "role failed");
        shutdown.trigger();
    }
    shutdown.run().await;
    result
}

/// The debug console is a process-level concern this build does not
/// expose; the flag is still recognized so configurations carry over.
pub(crate) fn note_console_flag(enabled: bool) {
    if enabled {
        warn!("debug console requested but not available in this build");
    }
}
