//! Typed event channels delivered to the application over a single
//! `mpsc` stream, rather than string-keyed observer callbacks.

use crate::{dht::DhtRecord, gossip::GossipReceive, id::PeerId};

/// Severity of a [`MeshEvent::Status`] message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// Every externally-visible thing a [`crate::mesh::Mesh`] can emit.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    /// A peer was discovered (not yet connected).
    PeerDiscovered(PeerId),
    /// A `PeerLink` reached `ChannelOpen` and is now usable.
    PeerConnected(PeerId),
    /// A `PeerLink` reached a terminal state.
    PeerDisconnected(PeerId, String),
    /// A gossip `chat`/`encrypted`/`dm` message addressed to us arrived.
    GossipReceived(GossipReceive),
    /// A DHT value resolved (local cache hit or network query).
    DhtValue(String, Option<DhtRecord>),
    /// An application-addressed binary payload arrived over a peer's
    /// data channel (`MeshFrame::Binary`).
    Binary(PeerId, Vec<u8>),
    /// A free-form status message, carrying a short peer-id prefix where
    /// relevant, for the application to display however it likes.
    Status { level: Level, message: String },
}
