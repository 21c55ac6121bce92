//! Peer discovery swarm collaborator interface.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SwarmError;
use crate::key::{DiscoveryKey, PublicKey};

/// How to participate in a discovery topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOpts {
    /// Actively connect to servers announcing the topic.
    pub client: bool,
    /// Announce this peer so clients connect to it.
    pub server: bool,
}

/// Identity and address of a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Transport address, for diagnostics only.
    pub address: String,
}

/// A bidirectional, frame-oriented peer connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Bytes) -> Result<(), SwarmError>;

    /// Receive the next frame; `None` once the connection has closed.
    async fn recv(&self) -> Result<Option<Bytes>, SwarmError>;

    /// Resolves when the connection closes, either side.
    async fn closed(&self);

    /// Close the connection.
    async fn close(&self);
}

/// A peer connection paired with who it reaches.
pub struct PeerConnection {
    /// The connection itself, shared between the replication stream and
    /// whoever watches for close.
    pub connection: Arc<dyn Connection>,
    /// The remote peer.
    pub peer: PeerInfo,
}

/// Topic-based discovery swarm yielding peer connections.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Join a discovery topic.
    async fn join(&self, topic: DiscoveryKey, opts: JoinOpts) -> Result<(), SwarmError>;

    /// Next peer connection, inbound or outbound; `None` once shut down.
    async fn accept(&self) -> Option<PeerConnection>;

    /// Leave all topics and close all connections.
    async fn shutdown(&self) -> Result<(), SwarmError>;
}
