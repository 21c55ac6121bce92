//! Downloader role: fetch the log from scratch into ephemeral storage and
//! verify it lands exactly as expected.

use std::sync::Arc;

use bytesize::ByteSize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use swarmlog_api::JoinOpts;

use crate::config::DownloaderConfig;
use crate::error::{FatalError, HarnessError};
use crate::invariant::InvariantMonitor;
use crate::progress::{ProgressTracker, DEFAULT_REPORT_INTERVAL};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{HarnessState, Phase};

use super::{
    finish_role, note_console_flag, readiness_gate, serve_until_shutdown,
    spawn_connection_bridge, unless_shutdown, DownloaderBackend, FATAL_CHANNEL_CAPACITY,
};

/// Drive the downloader lifecycle until termination.
pub async fn run_downloader(
    config: DownloaderConfig,
    backend: DownloaderBackend,
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
    config: DownloaderConfig,
    backend: DownloaderBackend,
    state: &Arc<HarnessState>,
    shutdown: &ShutdownCoordinator,
    cancel: &CancellationToken,
) -> Result<(), HarnessError> {
    let shape = config.shape;
    info!(key = %config.key, "starting swarmlog-e2e-tests downloader");
    info!(
        blocks = shape.length,
        block_size = %ByteSize(shape.block_size_bytes),
        total = %ByteSize(shape.byte_length),
        "expected log shape"
    );
    note_console_flag(config.console);

    let DownloaderBackend { make_store, swarm, metrics } = backend;

    let dir = tempfile::Builder::new()
        .prefix("swarmlog-e2e-store-")
        .tempdir()?;
    info!(path = %dir.path().display(), "using ephemeral store location");
    let store = make_store(dir.path());
    shutdown.register("ephemeral store dir", move || async move {
        dir.close().map_err(HarnessError::from)
    });
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

    state.advance(Phase::AwaitingReadiness);
    match unless_shutdown(cancel, readiness.wait_observed()).await {
        Some(observed) => observed?,
        None => return Ok(()),
    }

    let log = match unless_shutdown(cancel, store.open_by_key(config.key)).await {
        Some(opened) => opened?,
        None => return Ok(()),
    };

    // Storage was provisioned fresh for this run; anything already in the
    // log means it was not, and no download can be trusted. Checked before
    // any swarm join.
    if log.length() != 0 {
        return Err(HarnessError::Fatal(FatalError::StaleStorage { length: log.length() }));
    }

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

    state.advance(Phase::Running);
    state.mark_started();
    swarm
        .join(log.discovery_key(), JoinOpts { client: true, server: false })
        .await?;
    log.download_range(0, None).await?;
    info!("downloading log");

    serve_until_shutdown(cancel, &mut fatal_rx).await
}
