//! Sparse in-memory block logs and the store that owns them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use swarmlog_api::{
    Connection, DiscoveryKey, Log, LogError, LogEvent, LogInfo, LogStore, PublicKey,
};

use crate::replicate::ReplicationSession;

/// Domain separation context for name-derived log keys.
const NAME_KEY_CONTEXT: &str = "swarmlog v1 name key";

/// Capacity of each log's event fan-out channel.
pub const LOG_EVENT_BUFFER: usize = 1024;

#[derive(Default)]
struct LogState {
    blocks: BTreeMap<u64, Bytes>,
    byte_length: u64,
    interests: Vec<(u64, Option<u64>)>,
}

/// One append-only log held in memory.
///
/// A log opened by name is writable; a log opened by key is a replica
/// whose known length grows through peer announcements and whose blocks
/// arrive through replication sessions.
pub struct MemoryLog {
    key: PublicKey,
    discovery_key: DiscoveryKey,
    writable: bool,
    length: AtomicU64,
    contiguous: AtomicU64,
    state: Mutex<LogState>,
    events: broadcast::Sender<LogEvent>,
    interest_epoch: watch::Sender<u64>,
}

impl MemoryLog {
    fn new(key: PublicKey, writable: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(LOG_EVENT_BUFFER);
        let (interest_epoch, _) = watch::channel(0);
        Arc::new(Self {
            discovery_key: key.discovery_key(),
            key,
            writable,
            length: AtomicU64::new(0),
            contiguous: AtomicU64::new(0),
            state: Mutex::new(LogState::default()),
            events,
            interest_epoch,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        // Lock poisoning only happens if a holder panicked; the state is
        // plain data, so continue with it either way.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: LogEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Raise the known length from a peer announcement.
    pub(crate) fn note_remote_length(&self, length: u64) {
        let grew = {
            let _state = self.lock();
            if length > self.length.load(Ordering::Acquire) {
                self.length.store(length, Ordering::Release);
                true
            } else {
                false
            }
        };
        if grew {
            self.emit(LogEvent::Append { length });
        }
    }

    /// Store one replicated block. Returns false if it was already held.
    pub(crate) fn store_block(&self, index: u64, data: Bytes) -> bool {
        let stored = {
            let mut state = self.lock();
            if state.blocks.contains_key(&index) {
                return false;
            }
            state.byte_length += data.len() as u64;
            state.blocks.insert(index, data);
            if index + 1 > self.length.load(Ordering::Acquire) {
                self.length.store(index + 1, Ordering::Release);
            }
            let mut contiguous = self.contiguous.load(Ordering::Acquire);
            while state.blocks.contains_key(&contiguous) {
                contiguous += 1;
            }
            self.contiguous.store(contiguous, Ordering::Release);
            true
        };
        if stored {
            self.emit(LogEvent::Download { index });
        }
        stored
    }

    /// Contiguous runs of blocks that are wanted but not held.
    pub(crate) fn wanted_missing(&self) -> Vec<(u64, u64)> {
        let state = self.lock();
        let length = self.length.load(Ordering::Acquire);
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for &(start, end) in &state.interests {
            let end = end.unwrap_or(length).min(length);
            let mut run_start = None;
            for index in start..end {
                if state.blocks.contains_key(&index) {
                    if let Some(s) = run_start.take() {
                        runs.push((s, index));
                    }
                } else if run_start.is_none() {
                    run_start = Some(index);
                }
            }
            if let Some(s) = run_start {
                runs.push((s, end));
            }
        }
        runs
    }

    /// Blocks held within `start..end`.
    pub(crate) fn available_in(&self, start: u64, end: u64) -> Vec<(u64, Bytes)> {
        let state = self.lock();
        state
            .blocks
            .range(start..end)
            .map(|(&index, data)| (index, data.clone()))
            .collect()
    }

    pub(crate) fn interest_epoch(&self) -> watch::Receiver<u64> {
        self.interest_epoch.subscribe()
    }
}

#[async_trait]
impl Log for MemoryLog {
    fn key(&self) -> PublicKey {
        self.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn contiguous_length(&self) -> u64 {
        self.contiguous.load(Ordering::Acquire)
    }

    async fn append(&self, block: Bytes) -> Result<u64, LogError> {
        if !self.writable {
            return Err(LogError::NotWritable(self.key.to_string()));
        }
        let (index, length) = {
            let mut state = self.lock();
            let index = self.length.load(Ordering::Acquire);
            state.byte_length += block.len() as u64;
            state.blocks.insert(index, block);
            let length = index + 1;
            self.length.store(length, Ordering::Release);
            self.contiguous.store(length, Ordering::Release);
            (index, length)
        };
        self.emit(LogEvent::Append { length });
        Ok(index)
    }

    async fn download_range(&self, start: u64, end: Option<u64>) -> Result<(), LogError> {
        {
            let mut state = self.lock();
            state.interests.push((start, end));
        }
        self.interest_epoch.send_modify(|epoch| *epoch += 1);
        Ok(())
    }

    async fn info(&self) -> Result<LogInfo, LogError> {
        let state = self.lock();
        Ok(LogInfo {
            length: self.length.load(Ordering::Acquire),
            byte_length: state.byte_length,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}

pub(crate) struct StoreInner {
    seed: [u8; 32],
    logs: Mutex<HashMap<DiscoveryKey, Arc<MemoryLog>>>,
    opened: broadcast::Sender<Arc<MemoryLog>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StoreInner {
    pub(crate) fn log_for(&self, discovery_key: &DiscoveryKey) -> Option<Arc<MemoryLog>> {
        match self.logs.lock() {
            Ok(logs) => logs.get(discovery_key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(discovery_key).cloned(),
        }
    }

    pub(crate) fn open_logs(&self) -> Vec<Arc<MemoryLog>> {
        match self.logs.lock() {
            Ok(logs) => logs.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    pub(crate) fn subscribe_opened(&self) -> broadcast::Receiver<Arc<MemoryLog>> {
        self.opened.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// In-memory implementation of the log storage collaborator.
#[derive(Clone)]
pub struct MemoryLogStore {
    inner: Arc<StoreInner>,
}

impl MemoryLogStore {
    /// Create a store. The seed namespaces name-derived keys, playing the
    /// role a storage directory plays for a durable store.
    pub fn new(seed: [u8; 32]) -> Self {
        let (opened, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(StoreInner {
                seed,
                logs: Mutex::new(HashMap::new()),
                opened,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The key `open_by_name` would derive for `name` on this store.
    pub fn name_key(&self, name: &str) -> PublicKey {
        let mut material = Vec::with_capacity(self.inner.seed.len() + name.len());
        material.extend_from_slice(&self.inner.seed);
        material.extend_from_slice(name.as_bytes());
        PublicKey::from_bytes(blake3::derive_key(NAME_KEY_CONTEXT, &material))
    }

    fn open(&self, key: PublicKey, writable: bool) -> Result<Arc<dyn Log>, LogError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        let discovery_key = key.discovery_key();
        let mut logs = match self.inner.logs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = logs.get(&discovery_key) {
            return Ok(Arc::clone(existing) as Arc<dyn Log>);
        }
        let log = MemoryLog::new(key, writable);
        logs.insert(discovery_key, Arc::clone(&log));
        drop(logs);
        let _ = self.inner.opened.send(Arc::clone(&log));
        Ok(log as Arc<dyn Log>)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn open_by_name(&self, name: &str) -> Result<Arc<dyn Log>, LogError> {
        self.open(self.name_key(name), true)
    }

    async fn open_by_key(&self, key: PublicKey) -> Result<Arc<dyn Log>, LogError> {
        self.open(key, false)
    }

    fn replicate(&self, conn: Arc<dyn Connection>) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        ReplicationSession::spawn(Arc::clone(&self.inner), conn);
    }

    async fn close(&self) -> Result<(), LogError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn append_tracks_lengths_and_bytes() {
        let store = MemoryLogStore::new([0u8; 32]);
        let log = store.open_by_name("test").await.unwrap();
        assert_eq!(log.append(Bytes::from(vec![0u8; 64])).await.unwrap(), 0);
        assert_eq!(log.append(Bytes::from(vec![0u8; 64])).await.unwrap(), 1);
        assert_eq!(log.length(), 2);
        assert_eq!(log.contiguous_length(), 2);
        let info = log.info().await.unwrap();
        assert_eq!(info, LogInfo { length: 2, byte_length: 128 });
    }

    #[tokio::test]
    async fn name_keys_are_deterministic_per_store() {
        let a = MemoryLogStore::new([1u8; 32]);
        let b = MemoryLogStore::new([2u8; 32]);
        assert_eq!(a.name_key("log"), a.name_key("log"));
        assert_ne!(a.name_key("log"), a.name_key("other"));
        assert_ne!(a.name_key("log"), b.name_key("log"));
    }

    #[tokio::test]
    async fn replica_is_not_writable() {
        let store = MemoryLogStore::new([0u8; 32]);
        let log = store
            .open_by_key(PublicKey::from_bytes([9u8; 32]))
            .await
            .unwrap();
        assert_matches!(
            log.append(Bytes::from_static(b"x")).await,
            Err(LogError::NotWritable(_))
        );
    }

    #[tokio::test]
    async fn stored_blocks_fill_gaps_in_order() {
        let store = MemoryLogStore::new([0u8; 32]);
        store
            .open_by_key(PublicKey::from_bytes([9u8; 32]))
            .await
            .unwrap();
        let log = store
            .inner
            .log_for(&PublicKey::from_bytes([9u8; 32]).discovery_key())
            .unwrap();
        log.note_remote_length(3);
        assert_eq!(log.length(), 3);
        assert_eq!(log.contiguous_length(), 0);

        assert!(log.store_block(1, Bytes::from_static(b"b")));
        assert_eq!(log.contiguous_length(), 0);
        assert!(log.store_block(0, Bytes::from_static(b"a")));
        assert_eq!(log.contiguous_length(), 2);
        assert!(!log.store_block(1, Bytes::from_static(b"b")));
        assert!(log.store_block(2, Bytes::from_static(b"c")));
        assert_eq!(log.contiguous_length(), 3);
        assert_eq!(log.info().await.unwrap().byte_length, 3);
    }

    #[tokio::test]
    async fn wanted_missing_respects_interests_and_held_blocks() {
        let store = MemoryLogStore::new([0u8; 32]);
        store
            .open_by_key(PublicKey::from_bytes([9u8; 32]))
            .await
            .unwrap();
        let log = store
            .inner
            .log_for(&PublicKey::from_bytes([9u8; 32]).discovery_key())
            .unwrap();
        log.note_remote_length(5);
        assert!(log.wanted_missing().is_empty());

        log.download_range(0, None).await.unwrap();
        assert_eq!(log.wanted_missing(), vec![(0, 5)]);

        log.store_block(2, Bytes::from_static(b"c"));
        assert_eq!(log.wanted_missing(), vec![(0, 2), (3, 5)]);
    }

    #[tokio::test]
    async fn closed_store_rejects_opens() {
        let store = MemoryLogStore::new([0u8; 32]);
        store.close().await.unwrap();
        assert!(matches!(store.open_by_name("x").await, Err(LogError::Closed)));
    }
}
