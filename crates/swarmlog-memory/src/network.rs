//! Shared in-process topic registry backing the loopback swarm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use swarmlog_api::{DiscoveryKey, JoinOpts, PeerConnection, PublicKey};

use crate::connection::MemoryConnection;

/// One swarm's registration on one topic.
pub(crate) struct TopicMember {
    pub(crate) member_id: u64,
    pub(crate) peer: PublicKey,
    pub(crate) address: String,
    pub(crate) opts: JoinOpts,
    pub(crate) sink: mpsc::UnboundedSender<PeerConnection>,
    pub(crate) conns: Arc<Mutex<Vec<Arc<MemoryConnection>>>>,
}

#[derive(Default)]
pub(crate) struct NetworkState {
    pub(crate) topics: HashMap<DiscoveryKey, Vec<TopicMember>>,
    pub(crate) next_member: u64,
}

/// The in-process "internet" a set of [`crate::MemorySwarm`]s share.
///
/// Clone handles freely; all clones see the same topics.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NetworkState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
