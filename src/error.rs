//! Error taxonomy, one variant per distinct failure kind the mesh can
//! surface.
//!
//! Validation/crypto/replay failures are never fatal for a [`crate::mesh::Mesh`]
//! or a [`crate::peer::PeerLink`] — callers that receive them are expected
//! to drop the offending frame and carry on.

use thiserror::Error;

/// Errors surfaced by the transport (the WebRTC black box).
///
/// Fatal for the [`crate::peer::PeerLink`] that produced them.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("failed to create peer connection: {0}")]
    CreateConnection(String),
    #[error("failed to create SDP offer: {0}")]
    CreateOffer(String),
    #[error("failed to create SDP answer: {0}")]
    CreateAnswer(String),
    #[error("failed to set local description: {0}")]
    SetLocalDescription(String),
    #[error("failed to set remote description: {0}")]
    SetRemoteDescription(String),
    #[error("failed to add ICE candidate: {0}")]
    AddIceCandidate(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("send over data channel failed: {0}")]
    Send(String),
}

/// Top-level error type for every fallible operation in this crate.
#[derive(Clone, Debug, Error)]
pub enum MeshError {
    /// Operation attempted in the wrong handshake state. Callers typically
    /// tolerate this (e.g. an answer arriving when already `Stable`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying WebRTC failure. Fatal for the link that produced it.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An attempt, step, ICE negotiation, or DHT query exceeded its time
    /// budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Admission was refused because the mesh is at capacity. Surfaced on
    /// the wire as `connection-rejected`, not as an exception.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Malformed SDP, ICE, or gossip frame. The frame is dropped; the peer
    /// is not penalized.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A nonce was already seen; the envelope is a replay and is dropped.
    #[error("replay detected")]
    ReplayDetected,

    /// Encryption/decryption/signing failure. The frame is dropped, not
    /// retried.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A directed gossip send found no viable next hop and its TTL was
    /// exhausted. Silently dropped.
    #[error("no route to peer")]
    RouteUnreachable,
}

/// Convenience alias used throughout the crate.
pub type MeshResult<T> = Result<T, MeshError>;
