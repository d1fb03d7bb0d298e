//! SignalingHandler: translates signaling messages into PeerLink /
//! ConnectionManager calls, resolves offer/answer races.

pub mod protocol;

use std::rc::Rc;

use tracing::debug;

use crate::{
    connection::ConnectionManager,
    discovery::PeerDiscovery,
    id::PeerId,
};

pub use protocol::{ConnectionRejected, SignalingEnvelope, SignalingMessage};

/// Outbound half of the signaling channel, injected into whichever
/// component needs to speak on it (: "each subcomponent
/// receives only the capability interfaces it needs").
pub trait SignalingSender {
    fn send(&self, envelope: SignalingEnvelope);
}

/// Dispatches inbound [`SignalingEnvelope`]s to [`PeerDiscovery`] and
/// [`ConnectionManager`]. Holds no state of its own beyond its
/// collaborators.
pub struct SignalingHandler {
    self_id: PeerId,
    discovery: Rc<PeerDiscovery>,
    connections: Rc<ConnectionManager>,
}

impl SignalingHandler {
    pub fn new(
        self_id: PeerId,
        discovery: Rc<PeerDiscovery>,
        connections: Rc<ConnectionManager>,
    ) -> Self {
        Self { self_id, discovery, connections }
    }

    /// Drops messages from self or not addressed to us; ignores
    /// `ping`/`pong`/`cleanup`/`cleanup-all`.
    pub async fn handle(&self, envelope: SignalingEnvelope) {
        if envelope.from == self.self_id {
            return;
        }
        if let Some(to) = envelope.to {
            if to != self.self_id {
                return;
            }
        }

        match envelope.message {
            SignalingMessage::Announce { data } | SignalingMessage::PeerDiscovered { data } => {
                self.discovery.add(data);
            }
            SignalingMessage::Goodbye => {
                self.discovery.remove(envelope.from);
                self.connections
                    .disconnect_peer(envelope.from, "left network".to_string())
                    .await;
            }
            SignalingMessage::Offer { data } => {
                if let Err(e) = data.validate(crate::transport::SdpType::Offer) {
                    debug!(peer = %envelope.from, error = %e, "dropped malformed offer");
                    return;
                }
                self.connections.handle_offer(envelope.from, data).await;
            }
            SignalingMessage::Answer { data } => {
                if let Err(e) = data.validate(crate::transport::SdpType::Answer) {
                    debug!(peer = %envelope.from, error = %e, "dropped malformed answer");
                    return;
                }
                self.connections.handle_answer(envelope.from, data).await;
            }
            SignalingMessage::IceCandidate { data } => {
                self.connections.handle_ice(envelope.from, data).await;
            }
            SignalingMessage::RenegotiationOffer { data } => {
                self.connections.handle_renegotiation_offer(envelope.from, data).await;
            }
            SignalingMessage::RenegotiationAnswer { data } => {
                self.connections.handle_renegotiation_answer(envelope.from, data).await;
            }
            SignalingMessage::IceRestartOffer { data } => {
                self.connections.handle_renegotiation_offer(envelope.from, data).await;
            }
            SignalingMessage::IceRestartAnswer { data } => {
                self.connections.handle_renegotiation_answer(envelope.from, data).await;
            }
            SignalingMessage::ConnectionRejected { data: _ } => {
                self.connections.handle_connection_rejected(envelope.from).await;
                if self.connections.is_isolated() {
                    self.discovery.try_next_closest(envelope.from);
                }
            }
            SignalingMessage::Ping
            | SignalingMessage::Pong
            | SignalingMessage::Cleanup
            | SignalingMessage::CleanupAll => {}
        }
    }
}
