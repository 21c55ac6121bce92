//! Seeder role: fully mirror the log and re-serve it to other peers.

use std::sync::Arc;

use bytesize::ByteSize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use swarmlog_api::JoinOpts;

use crate::config::SeederConfig;
use crate::error::HarnessError;
use crate::invariant::InvariantMonitor;
use crate::progress::{ProgressTracker, DEFAULT_REPORT_INTERVAL};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{HarnessState, Phase};

use super::{
    finish_role, readiness_gate, serve_until_shutdown, spawn_connection_bridge, unless_shutdown,
    Backend, FATAL_CHANNEL_CAPACITY,
};

/// Drive the seeder lifecycle until termination. Completing the download
/// does not end the process; the log keeps serving until a signal or the
/// deadline arrives.
pub async fn run_seeder(
    config: SeederConfig,
    backend: Backend,
    cancel: CancellationToken,
) -> Result<(), HarnessError> {
    let state = Arc::new(HarnessState::new());
    let shutdown = ShutdownCoordinator::new(Arc::clone(&state), cancel.clone());
    shutdown.spawn_signal_listener();
    if let Some(deadline) = config.timeout {
        shutdown.spawn_deadline(deadline);
    }
    let result = drive(config, backend, &state, &shutdown, &cancel).await;
    finish_role(&shutdown, result).await
}

async fn drive(
    config: SeederConfig,
    backend: Backend,
    state: &Arc<HarnessState>,
    shutdown: &ShutdownCoordinator,
    cancel: &CancellationToken,
) -> Result<(), HarnessError> {
    let shape = config.shape;
    info!(
        key = %config.key,
        size = %ByteSize(shape.byte_length),
        block_size = %ByteSize(shape.block_size_bytes),
        "starting swarmlog-e2e-tests seeder"
    );

    let Backend { store, swarm, metrics } = backend;
    {
        let store = Arc::clone(&store);
        shutdown.register("store", move || async move {
            store.close().await.map_err(HarnessError::from)
        });
    }
    {
        let swarm = Arc::clone(&swarm);
        shutdown.register("swarm", move || async move {
            swarm.shutdown().await.map_err(HarnessError::from)
        });
    }
    spawn_connection_bridge(
        Arc::clone(&swarm),
        Arc::clone(&store),
        Arc::clone(state),
        cancel.clone(),
    );
    let readiness = readiness_gate(shutdown, metrics);

    let log = match unless_shutdown(cancel, store.open_by_key(config.key)).await {
        Some(opened) => opened?,
        None => return Ok(()),
    };
    let (completed_tx, completed_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel(FATAL_CHANNEL_CAPACITY);
    InvariantMonitor::spawn(Arc::clone(&log), shape, fatal_tx, completed_tx);
    ProgressTracker::spawn(
        Arc::clone(&log),
        shape.block_size_bytes,
        DEFAULT_REPORT_INTERVAL,
        Arc::clone(state),
        completed_rx,
    );

    state.advance(Phase::AwaitingReadiness);
    match unless_shutdown(cancel, readiness.wait_observed()).await {
        Some(observed) => observed?,
        None => return Ok(()),
    }

    state.advance(Phase::Running);
    state.mark_started();
    swarm
        .join(log.discovery_key(), JoinOpts { client: true, server: true })
        .await?;
    log.download_range(0, None).await?;
    info!(length = log.length(), expected = shape.length, "started downloading");

    serve_until_shutdown(cancel, &mut fatal_rx).await
}
