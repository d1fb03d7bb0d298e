//! The `Transport` contract: the black-box WebRTC stack this crate
//! treats as an external collaborator.
//!
//! A plain, non-wasm trait surface over a peer connection, generalized
//! so a host can back it with whatever concrete stack it likes (a native
//! `webrtc-rs` connection, a wasm `web-sys` binding, ...).

#[cfg(any(test, feature = "mock-transport"))]
pub mod mock;

use futures::{future::LocalBoxFuture, stream::LocalBoxStream};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Kind of media track a transceiver carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Direction of a pre-allocated transceiver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Session description (offer or answer), carried as an opaque SDP
/// string plus its declared type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Sdp {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// SDP validation: `type` must match `expected`, `sdp` must be non-empty,
/// at least 10 characters, and contain `v=0`.
impl Sdp {
    pub fn validate(&self, expected: SdpType) -> Result<(), crate::error::MeshError> {
        if self.sdp_type != expected {
            return Err(crate::error::MeshError::Validation(format!(
                "expected SDP type {expected:?}, got {:?}",
                self.sdp_type
            )));
        }
        if self.sdp.len() < 10 || !self.sdp.contains("v=0") {
            return Err(crate::error::MeshError::Validation(
                "SDP missing v=0 or too short".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// One ICE candidate, as received from or handed to the transport.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// Opaque handle to a local or remote media track. The core never
/// inspects the contents — only identity (`track_id`) and stream
/// membership (`stream_id`) for the loopback guard.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MediaTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Whether this stream was created by this node (as opposed to one
    /// mirrored back by a buggy or malicious remote). Part of the
    /// stream-loopback guard.
    pub local_origin: bool,
}

/// Signaling state of the underlying `RTCPeerConnection`-equivalent, used
/// by renegotiation gate ("stable or have-local-offer").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// High-level connectivity state of the underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a [`PeerConnection`] emits asynchronously.
///
/// Not `Clone`: [`ConnectionEvent::RemoteDataChannel`] carries a boxed,
/// non-cloneable [`DataChannel`].
pub enum ConnectionEvent {
    IceCandidate(IceCandidate),
    NegotiationNeeded,
    SignalingStateChange(SignalingState),
    ConnectionStateChange(ConnectionState),
    /// A remote track arrived on the given transceiver direction/kind; the
    /// `PeerLink` applies the loopback guard before surfacing it further.
    Track { track: MediaTrack, transceiver_direction: Direction },
    /// The remote peer created the data channel (non-initiator side of
    /// `create(initiator)`).
    RemoteDataChannel(Box<dyn DataChannel>),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            Self::SignalingStateChange(s) => {
                f.debug_tuple("SignalingStateChange").field(s).finish()
            }
            Self::ConnectionStateChange(s) => {
                f.debug_tuple("ConnectionStateChange").field(s).finish()
            }
            Self::Track { track, transceiver_direction } => f
                .debug_struct("Track")
                .field("track", track)
                .field("transceiver_direction", transceiver_direction)
                .finish(),
            Self::RemoteDataChannel(_) => write!(f, "RemoteDataChannel(..)"),
        }
    }
}

/// Events a [`DataChannel`] emits.
#[derive(Clone, Debug)]
pub enum DataChannelEvent {
    Open,
    Close,
    Message(Vec<u8>),
    Error(String),
}

/// One ordered, reliable data channel.
pub trait DataChannel {
    /// Sends `bytes`. Fails with [`TransportError::ChannelNotOpen`] if the
    /// channel isn't open yet — `send()` contract.
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn events(&self) -> LocalBoxStream<'static, DataChannelEvent>;
}

/// One `RTCPeerConnection`-equivalent.
pub trait PeerConnection {
    fn create_offer(&self) -> LocalBoxFuture<'_, Result<Sdp, TransportError>>;

    fn create_answer(&self) -> LocalBoxFuture<'_, Result<Sdp, TransportError>>;

    fn set_local_description(
        &self,
        sdp: Sdp,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>>;

    fn set_remote_description(
        &self,
        sdp: Sdp,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>>;

    /// ICE failures are logged by the caller, never propagated as a
    /// `MeshError`.
    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>>;

    /// Pre-allocates a transceiver of `kind` in `dir`. Called exactly once
    /// per kind at `create()` time,  ("so later media
    /// addition does not reorder SDP m-lines").
    fn add_transceiver(&self, kind: MediaKind, dir: Direction);

    /// Replaces the track on the pre-allocated transceiver of `kind`.
    /// Never adds or removes a transceiver.
    fn replace_track(&self, kind: MediaKind, track: Option<MediaTrack>);

    fn create_data_channel(&self) -> Box<dyn DataChannel>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    fn events(&self) -> LocalBoxStream<'static, ConnectionEvent>;

    fn close(&self);
}

/// ICE server / transport configuration passed to `Transport::new_connection`.
#[derive(Clone, Debug, Default)]
pub struct IceConfig {
    pub ice_servers: Vec<String>,
}

/// Factory for [`PeerConnection`]s. A host implements this once for
/// whatever concrete WebRTC stack it embeds.
pub trait Transport {
    /// Creates a new peer connection. `initiator` decides whether the
    /// caller is expected to create the data channel itself (true) or
    /// install a handler for the remote-created one (false).
    fn new_connection(
        &self,
        cfg: IceConfig,
        initiator: bool,
    ) -> Box<dyn PeerConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_sdp(sdp_type: SdpType) -> Sdp {
        Sdp { sdp_type, sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_string() }
    }

    #[test]
    fn validate_accepts_matching_type() {
        assert!(valid_sdp(SdpType::Offer).validate(SdpType::Offer).is_ok());
        assert!(valid_sdp(SdpType::Answer).validate(SdpType::Answer).is_ok());
    }

    #[test]
    fn validate_rejects_type_mismatch() {
        let offer_labeled_as_answer = valid_sdp(SdpType::Offer);
        assert!(offer_labeled_as_answer.validate(SdpType::Answer).is_err());
    }

    #[test]
    fn validate_rejects_short_or_missing_v0() {
        let sdp = Sdp { sdp_type: SdpType::Offer, sdp: "short".to_string() };
        assert!(sdp.validate(SdpType::Offer).is_err());
    }
}
