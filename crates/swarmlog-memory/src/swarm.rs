//! Loopback discovery swarm.
//!
//! Joining a topic matches this swarm against every already-joined member
//! whose mode complements ours (our client side to their server side or
//! vice versa) and hands both swarms one end of a fresh in-process
//! connection through `accept`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use swarmlog_api::{
    Connection, DiscoveryKey, JoinOpts, PeerConnection, PeerInfo, PublicKey, Swarm, SwarmError,
};

use crate::connection::MemoryConnection;
use crate::network::{MemoryNetwork, TopicMember};

/// Loopback implementation of the swarm collaborator.
pub struct MemorySwarm {
    network: MemoryNetwork,
    local_key: PublicKey,
    address: String,
    member_id: u64,
    incoming_tx: mpsc::UnboundedSender<PeerConnection>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<PeerConnection>>,
    conns: Arc<StdMutex<Vec<Arc<MemoryConnection>>>>,
    shut_down: AtomicBool,
    closed: CancellationToken,
}

impl MemorySwarm {
    /// Join `network` as a new peer with a random identity.
    pub fn new(network: MemoryNetwork) -> Self {
        let key: [u8; 32] = rand::thread_rng().gen();
        Self::with_key(network, PublicKey::from_bytes(key))
    }

    /// Join `network` as a new peer with a fixed identity.
    pub fn with_key(network: MemoryNetwork, local_key: PublicKey) -> Self {
        let member_id = {
            let mut state = network.lock();
            state.next_member += 1;
            state.next_member
        };
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            network,
            local_key,
            address: format!("mem://{member_id}"),
            member_id,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            conns: Arc::new(StdMutex::new(Vec::new())),
            shut_down: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// This swarm's peer identity.
    pub fn local_key(&self) -> PublicKey {
        self.local_key
    }

    fn track(conns: &Arc<StdMutex<Vec<Arc<MemoryConnection>>>>, conn: &Arc<MemoryConnection>) {
        match conns.lock() {
            Ok(mut guard) => guard.push(Arc::clone(conn)),
            Err(poisoned) => poisoned.into_inner().push(Arc::clone(conn)),
        }
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn join(&self, topic: DiscoveryKey, opts: JoinOpts) -> Result<(), SwarmError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        let mut state = self.network.lock();
        let members = state.topics.entry(topic).or_default();
        for member in members.iter() {
            if member.member_id == self.member_id {
                continue;
            }
            let matched = (opts.client && member.opts.server) || (opts.server && member.opts.client);
            if !matched {
                continue;
            }
            let (ours, theirs) = MemoryConnection::pair();
            let ours = Arc::new(ours);
            let theirs = Arc::new(theirs);
            Self::track(&self.conns, &ours);
            Self::track(&member.conns, &theirs);
            let _ = self.incoming_tx.send(PeerConnection {
                connection: ours as Arc<dyn Connection>,
                peer: PeerInfo { public_key: member.peer, address: member.address.clone() },
            });
            let _ = member.sink.send(PeerConnection {
                connection: theirs as Arc<dyn Connection>,
                peer: PeerInfo { public_key: self.local_key, address: self.address.clone() },
            });
        }
        members.push(TopicMember {
            member_id: self.member_id,
            peer: self.local_key,
            address: self.address.clone(),
            opts,
            sink: self.incoming_tx.clone(),
            conns: Arc::clone(&self.conns),
        });
        debug!(topic = %topic, client = opts.client, server = opts.server, "joined topic");
        Ok(())
    }

    async fn accept(&self) -> Option<PeerConnection> {
        let mut rx = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            conn = rx.recv() => conn,
        }
    }

    async fn shutdown(&self) -> Result<(), SwarmError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut state = self.network.lock();
            for members in state.topics.values_mut() {
                members.retain(|member| member.member_id != self.member_id);
            }
        }
        let conns: Vec<Arc<MemoryConnection>> = {
            match self.conns.lock() {
                Ok(mut guard) => guard.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            }
        };
        for conn in conns {
            conn.close().await;
        }
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> DiscoveryKey {
        PublicKey::from_bytes([5u8; 32]).discovery_key()
    }

    #[tokio::test]
    async fn client_and_server_get_connected() {
        let network = MemoryNetwork::new();
        let server = MemorySwarm::new(network.clone());
        let client = MemorySwarm::new(network);

        server
            .join(topic(), JoinOpts { client: false, server: true })
            .await
            .unwrap();
        client
            .join(topic(), JoinOpts { client: true, server: false })
            .await
            .unwrap();

        let on_server = server.accept().await.unwrap();
        let on_client = client.accept().await.unwrap();
        assert_eq!(on_server.peer.public_key, client.local_key());
        assert_eq!(on_client.peer.public_key, server.local_key());
    }

    #[tokio::test]
    async fn two_clients_do_not_connect() {
        let network = MemoryNetwork::new();
        let a = MemorySwarm::new(network.clone());
        let b = MemorySwarm::new(network);

        a.join(topic(), JoinOpts { client: true, server: false })
            .await
            .unwrap();
        b.join(topic(), JoinOpts { client: true, server: false })
            .await
            .unwrap();

        b.shutdown().await.unwrap();
        assert!(b.accept().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_established_connections() {
        let network = MemoryNetwork::new();
        let server = MemorySwarm::new(network.clone());
        let client = MemorySwarm::new(network);

        server
            .join(topic(), JoinOpts { client: false, server: true })
            .await
            .unwrap();
        client
            .join(topic(), JoinOpts { client: true, server: true })
            .await
            .unwrap();

        let held = client.accept().await.unwrap();
        server.shutdown().await.unwrap();
        held.connection.closed().await;
        assert!(matches!(server.join(topic(), JoinOpts { client: true, server: true }).await, Err(SwarmError::Closed)));
    }
}
