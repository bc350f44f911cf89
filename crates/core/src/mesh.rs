//! Contracts for the encrypted mesh overlay.
//!
//! The overlay (NAT traversal, relaying, key exchange, framing) is an
//! external collaborator. The provider only consumes these traits: framed
//! sends addressed by [`PeerId`], an incoming envelope stream, and per-peer
//! traffic tunnels for VM packet forwarding.

use crate::error::MeshError;
use crate::peer::PeerId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

/// One control message received from the mesh.
#[derive(Debug, Clone)]
pub struct MeshEnvelope {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// The mesh transport, as seen by the provider.
#[async_trait]
pub trait Mesh: Send + Sync {
    /// This node's own peer id.
    fn local_peer(&self) -> PeerId;

    /// Send one framed message to a peer.
    async fn send_to(&self, peer: &PeerId, payload: &[u8]) -> Result<(), MeshError>;

    /// The last endpoint the mesh learned for a peer, if any.
    fn endpoint_of(&self, peer: &PeerId) -> Option<SocketAddr>;

    /// Open (or reuse) the traffic tunnel addressed to a peer.
    async fn open_tunnel(&self, peer: &PeerId) -> Result<Arc<dyn TunnelSession>, MeshError>;

    /// Tear the mesh down. Further sends fail with [`MeshError::Closed`].
    async fn close(&self);
}

/// The traffic channel for one peer.
///
/// Packets injected here are carried to the peer; packets the peer sends
/// back surface on the return stream. Both directions end when the session
/// closes.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Submit one packet for delivery to the peer.
    async fn inject(&self, packet: &[u8]) -> Result<(), MeshError>;

    /// Next packet returned by the peer, or `None` once the session closed.
    async fn next_return(&self) -> Option<Vec<u8>>;

    async fn close(&self);
}
