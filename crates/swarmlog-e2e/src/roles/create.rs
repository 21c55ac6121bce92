//! Creator role: originate the log, grow it to the target size, serve it.

use std::sync::Arc;

use bytes::Bytes;
use bytesize::ByteSize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use swarmlog_api::JoinOpts;

use crate::config::CreatorConfig;
use crate::error::{FatalError, HarnessError};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{HarnessState, Phase};

use super::{
    finish_role, note_console_flag, readiness_gate, spawn_connection_bridge, unless_shutdown,
    Backend, GROW_LOG_INTERVAL,
};

/// Drive the creator lifecycle until termination.
pub async fn run_creator(
    config: CreatorConfig,
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
    config: CreatorConfig,
    backend: Backend,
    state: &Arc<HarnessState>,
    shutdown: &ShutdownCoordinator,
    cancel: &CancellationToken,
) -> Result<(), HarnessError> {
    info!("starting swarmlog-e2e-tests creator");
    note_console_flag(config.console);

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

    state.advance(Phase::AwaitingReadiness);
    match unless_shutdown(cancel, readiness.wait_observed()).await {
        Some(observed) => observed?,
        None => return Ok(()),
    }

    let log = match unless_shutdown(cancel, store.open_by_name(&config.log_name())).await {
        Some(opened) => opened?,
        None => return Ok(()),
    };
    state.advance(Phase::Running);
    state.mark_started();

    let shape = config.shape;
    if log.length() >= shape.length {
        info!(length = log.length(), "found existing log");
    }
    // Block content does not matter to the experiment, only its size.
    let block = Bytes::from(vec![0u8; shape.block_size_bytes as usize]);
    let mut index = log.length();
    while index < shape.length {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if index % GROW_LOG_INTERVAL == 0 {
            info!(block = index, "added block");
        }
        log.append(block.clone()).await?;
        index += 1;
    }

    swarm
        .join(log.discovery_key(), JoinOpts { client: false, server: true })
        .await?;

    // The driver performed the writes itself, so any divergence here is
    // an internal logic error, not an externally observed violation.
    let info = log.info().await?;
    if info.length != shape.length {
        let fatal = FatalError::CreatorShapeMismatch {
            field: "length",
            expected: shape.length,
            actual: info.length,
        };
        error!(%fatal, "created log diverges from target shape");
        return Err(HarnessError::Fatal(fatal));
    }
    if info.byte_length != shape.byte_length {
        let fatal = FatalError::CreatorShapeMismatch {
            field: "byte length",
            expected: shape.byte_length,
            actual: info.byte_length,
        };
        error!(%fatal, "created log diverges from target shape");
        return Err(HarnessError::Fatal(fatal));
    }

    info!(
        size = %ByteSize(info.byte_length),
        blocks = info.length,
        block_size = %ByteSize(shape.block_size_bytes),
        "started serving log"
    );
    info!(
        public_key = %log.key(),
        discovery_key = %log.discovery_key(),
        "log announced"
    );

    cancel.cancelled().await;
    Ok(())
}
