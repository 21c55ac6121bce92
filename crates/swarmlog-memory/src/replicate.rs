//! Block exchange between stores over a peer connection.
//!
//! One session runs per replicated connection. Each side announces the
//! known length of every open log, requests wanted blocks it is missing,
//! and serves requested blocks it holds. Requests are remembered as a
//! want-set, so blocks that arrive locally later are forwarded too; that
//! is what lets a seeder supply peers while it is still pulling.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use swarmlog_api::{Connection, DiscoveryKey, Log, SwarmError};

use crate::log::{MemoryLog, StoreInner};

#[derive(Debug, Serialize, Deserialize)]
enum WireMessage {
    /// Known length of the sender's copy of a log.
    Announce { discovery_key: [u8; 32], length: u64 },
    /// The sender wants blocks `start..end`.
    Request { discovery_key: [u8; 32], start: u64, end: u64 },
    /// One block of log data.
    Block { discovery_key: [u8; 32], index: u64, data: Vec<u8> },
}

/// Per-log replication state on one connection.
struct LogSync {
    log: Arc<MemoryLog>,
    last_announced: Option<u64>,
    /// Indices requested from the peer and not yet received.
    requested: BTreeSet<u64>,
    /// Ranges the peer asked for, kept so later arrivals are forwarded.
    peer_wants: Vec<(u64, u64)>,
    /// Indices already sent to the peer.
    sent: BTreeSet<u64>,
}

/// Replication over one connection, for the connection's lifetime.
pub(crate) struct ReplicationSession;

impl ReplicationSession {
    pub(crate) fn spawn(store: Arc<StoreInner>, conn: Arc<dyn Connection>) {
        tokio::spawn(run(store, conn));
    }
}

async fn run(store: Arc<StoreInner>, conn: Arc<dyn Connection>) {
    let cancel = CancellationToken::new();
    let _pump_guard = cancel.clone().drop_guard();
    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<DiscoveryKey>();
    let mut opened = store.subscribe_opened();
    let store_cancel = store.cancel_token();
    let mut logs: HashMap<DiscoveryKey, LogSync> = HashMap::new();

    for log in store.open_logs() {
        watch_log(&mut logs, log, &change_tx, &cancel);
    }
    let initial: Vec<DiscoveryKey> = logs.keys().copied().collect();
    for discovery_key in initial {
        if let Some(sync) = logs.get_mut(&discovery_key) {
            if sync_log(&conn, sync).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            _ = store_cancel.cancelled() => {
                conn.close().await;
                break;
            }
            frame = conn.recv() => match frame {
                Ok(Some(frame)) => {
                    if handle_frame(&store, &mut logs, &conn, frame, &change_tx, &cancel)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            },
            Some(discovery_key) = change_rx.recv() => {
                if let Some(sync) = logs.get_mut(&discovery_key) {
                    if sync_log(&conn, sync).await.is_err() {
                        break;
                    }
                }
            }
            log = opened.recv() => {
                if let Ok(log) = log {
                    let discovery_key = log.discovery_key();
                    watch_log(&mut logs, log, &change_tx, &cancel);
                    if let Some(sync) = logs.get_mut(&discovery_key) {
                        if sync_log(&conn, sync).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    trace!("replication session ended");
}

/// Track a log on this session and pump its change signals into the
/// session loop.
fn watch_log(
    logs: &mut HashMap<DiscoveryKey, LogSync>,
    log: Arc<MemoryLog>,
    change_tx: &mpsc::UnboundedSender<DiscoveryKey>,
    cancel: &CancellationToken,
) {
    let discovery_key = log.discovery_key();
    if logs.contains_key(&discovery_key) {
        return;
    }
    let mut events = log.subscribe();
    let mut interest = log.interest_epoch();
    let tx = change_tx.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if tx.send(discovery_key).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = interest.changed() => {
                    if changed.is_err() || tx.send(discovery_key).is_err() {
                        break;
                    }
                }
            }
        }
    });
    logs.insert(
        discovery_key,
        LogSync {
            log,
            last_announced: None,
            requested: BTreeSet::new(),
            peer_wants: Vec::new(),
            sent: BTreeSet::new(),
        },
    );
}

/// Bring one log's replication state up to date with its local state:
/// announce growth, serve newly available wanted blocks, request missing
/// wanted blocks.
async fn sync_log(conn: &Arc<dyn Connection>, sync: &mut LogSync) -> Result<(), SwarmError> {
    let discovery_key = *sync.log.discovery_key().as_bytes();

    let length = sync.log.length();
    if sync.last_announced.map_or(true, |announced| length > announced) {
        send_message(conn, &WireMessage::Announce { discovery_key, length }).await?;
        sync.last_announced = Some(length);
    }

    let wants = sync.peer_wants.clone();
    for (start, end) in wants {
        for (index, data) in sync.log.available_in(start, end) {
            if sync.sent.insert(index) {
                send_message(
                    conn,
                    &WireMessage::Block { discovery_key, index, data: data.to_vec() },
                )
                .await?;
            }
        }
    }

    let mut to_request: Vec<(u64, u64)> = Vec::new();
    for (start, end) in sync.log.wanted_missing() {
        let mut run: Option<(u64, u64)> = None;
        for index in start..end {
            if sync.requested.insert(index) {
                match &mut run {
                    Some((_, run_end)) if *run_end == index => *run_end = index + 1,
                    _ => {
                        if let Some(done) = run.take() {
                            to_request.push(done);
                        }
                        run = Some((index, index + 1));
                    }
                }
            } else if let Some(done) = run.take() {
                to_request.push(done);
            }
        }
        if let Some(done) = run {
            to_request.push(done);
        }
    }
    for (start, end) in to_request {
        send_message(conn, &WireMessage::Request { discovery_key, start, end }).await?;
    }

    Ok(())
}

async fn handle_frame(
    store: &Arc<StoreInner>,
    logs: &mut HashMap<DiscoveryKey, LogSync>,
    conn: &Arc<dyn Connection>,
    frame: Bytes,
    change_tx: &mpsc::UnboundedSender<DiscoveryKey>,
    cancel: &CancellationToken,
) -> Result<(), SwarmError> {
    let message = match postcard::from_bytes::<WireMessage>(&frame) {
        Ok(message) => message,
        Err(error) => {
            debug!(%error, "ignoring undecodable replication frame");
            return Ok(());
        }
    };
    match message {
        WireMessage::Announce { discovery_key, length } => {
            let key_bytes = discovery_key;
            let discovery_key = DiscoveryKey::from_bytes(discovery_key);
            if !logs.contains_key(&discovery_key) {
                // The open notification may have been dropped on a lagged
                // subscription; the store is still the source of truth.
                if let Some(log) = store.log_for(&discovery_key) {
                    watch_log(logs, log, change_tx, cancel);
                }
            }
            if let Some(sync) = logs.get_mut(&discovery_key) {
                sync.log.note_remote_length(length);
                let local_length = sync.log.length();
                if local_length > length {
                    // The peer announced from behind, e.g. it opened the
                    // log after this session's initial announce. Answer
                    // unconditionally so it catches up.
                    send_message(
                        conn,
                        &WireMessage::Announce { discovery_key: key_bytes, length: local_length },
                    )
                    .await?;
                    sync.last_announced = Some(local_length);
                }
                sync_log(conn, sync).await?;
            }
        }
        WireMessage::Request { discovery_key, start, end } => {
            let discovery_key = DiscoveryKey::from_bytes(discovery_key);
            if let Some(sync) = logs.get_mut(&discovery_key) {
                sync.peer_wants.push((start, end));
                sync_log(conn, sync).await?;
            }
        }
        WireMessage::Block { discovery_key, index, data } => {
            let discovery_key = DiscoveryKey::from_bytes(discovery_key);
            if let Some(sync) = logs.get_mut(&discovery_key) {
                sync.requested.remove(&index);
                sync.log.store_block(index, Bytes::from(data));
            }
        }
    }
    Ok(())
}

async fn send_message(
    conn: &Arc<dyn Connection>,
    message: &WireMessage,
) -> Result<(), SwarmError> {
    let encoded = match postcard::to_allocvec(message) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!(%error, "failed to encode replication frame");
            return Ok(());
        }
    };
    conn.send(Bytes::from(encoded)).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use swarmlog_api::{LogStore, PublicKey};

    use super::*;
    use crate::connection::MemoryConnection;
    use crate::log::MemoryLogStore;

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn replica_pulls_full_log() {
        let origin = MemoryLogStore::new([1u8; 32]);
        let replica = MemoryLogStore::new([2u8; 32]);

        let source = origin.open_by_name("log").await.unwrap();
        for byte in 0..5u8 {
            source.append(Bytes::from(vec![byte; 8])).await.unwrap();
        }

        let target = replica.open_by_key(source.key()).await.unwrap();
        target.download_range(0, None).await.unwrap();

        let (a, b) = MemoryConnection::pair();
        origin.replicate(Arc::new(a));
        replica.replicate(Arc::new(b));

        wait_for("replica to fill", || target.contiguous_length() == 5).await;
        assert_eq!(target.info().await.unwrap().byte_length, 40);
    }

    #[tokio::test]
    async fn blocks_appended_after_connect_are_forwarded() {
        let origin = MemoryLogStore::new([1u8; 32]);
        let replica = MemoryLogStore::new([2u8; 32]);

        let source = origin.open_by_name("log").await.unwrap();
        let target = replica.open_by_key(source.key()).await.unwrap();
        target.download_range(0, None).await.unwrap();

        let (a, b) = MemoryConnection::pair();
        origin.replicate(Arc::new(a));
        replica.replicate(Arc::new(b));

        source.append(Bytes::from_static(b"first")).await.unwrap();
        wait_for("first block", || target.contiguous_length() == 1).await;

        source.append(Bytes::from_static(b"second")).await.unwrap();
        wait_for("second block", || target.contiguous_length() == 2).await;
    }

    #[tokio::test]
    async fn seeder_relays_while_downloading() {
        let origin = MemoryLogStore::new([1u8; 32]);
        let seeder = MemoryLogStore::new([2u8; 32]);
        let downloader = MemoryLogStore::new([3u8; 32]);

        let source = origin.open_by_name("log").await.unwrap();
        for byte in 0..10u8 {
            source.append(Bytes::from(vec![byte; 4])).await.unwrap();
        }
        let key = source.key();

        // Downloader only ever talks to the seeder.
        let mirror = seeder.open_by_key(key).await.unwrap();
        mirror.download_range(0, None).await.unwrap();
        let sink = downloader.open_by_key(key).await.unwrap();
        sink.download_range(0, None).await.unwrap();

        let (a, b) = MemoryConnection::pair();
        origin.replicate(Arc::new(a));
        seeder.replicate(Arc::new(b));
        let (c, d) = MemoryConnection::pair();
        seeder.replicate(Arc::new(c));
        downloader.replicate(Arc::new(d));

        wait_for("downloader to fill via seeder", || {
            sink.contiguous_length() == 10
        })
        .await;
        assert_eq!(sink.info().await.unwrap().byte_length, 40);
    }

    #[tokio::test]
    async fn unknown_logs_are_ignored() {
        let origin = MemoryLogStore::new([1u8; 32]);
        let other = MemoryLogStore::new([2u8; 32]);

        let source = origin.open_by_name("log").await.unwrap();
        source.append(Bytes::from_static(b"data")).await.unwrap();

        // Other store never opened this key; the session must not create it.
        let unrelated = other.open_by_key(PublicKey::from_bytes([7u8; 32])).await.unwrap();

        let (a, b) = MemoryConnection::pair();
        origin.replicate(Arc::new(a));
        other.replicate(Arc::new(b));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unrelated.length(), 0);
    }

    #[tokio::test]
    async fn log_opened_after_connect_still_learns_length() {
        let origin = MemoryLogStore::new([1u8; 32]);
        let other = MemoryLogStore::new([2u8; 32]);

        let source = origin.open_by_name("log").await.unwrap();
        source.append(Bytes::from_static(b"data")).await.unwrap();

        let (a, b) = MemoryConnection::pair();
        origin.replicate(Arc::new(a));
        other.replicate(Arc::new(b));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let late = other.open_by_key(source.key()).await.unwrap();
        wait_for("late replica to learn length", || late.length() == 1).await;
    }
}
