//! Signaling wire protocol: one internally-tagged enum, one variant per
//! recognized message type, exhaustively matched at the single dispatch
//! site in `super::SignalingHandler`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{
    id::PeerId,
    transport::{IceCandidate, Sdp},
};

/// A signaling message as it appears on the wire: `{type, from, to?,
/// timestamp, data?}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub from: PeerId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<PeerId>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl SignalingEnvelope {
    /// Builds an outgoing envelope stamped with the current wall-clock
    /// time (wire-format timestamps are informational; nothing in this
    /// crate's logic depends on their value).
    pub fn new(from: PeerId, to: Option<PeerId>, message: SignalingMessage) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { from, to, timestamp, message }
    }
}

/// Recognized `type` values, table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Announce { data: PeerId },
    PeerDiscovered { data: PeerId },
    Goodbye,
    Offer { data: Sdp },
    Answer { data: Sdp },
    IceCandidate { data: IceCandidate },
    RenegotiationOffer { data: Sdp },
    RenegotiationAnswer { data: Sdp },
    IceRestartOffer { data: Sdp },
    IceRestartAnswer { data: Sdp },
    ConnectionRejected { data: ConnectionRejected },
    /// Ignored by the core.
    Ping,
    Pong,
    Cleanup,
    CleanupAll,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRejected {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<String>,
    pub current_count: usize,
    pub max_peers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpType;

    #[test]
    fn offer_round_trips_through_json() {
        let from = PeerId::random();
        let to = PeerId::random();
        let env = SignalingEnvelope::new(
            from,
            Some(to),
            SignalingMessage::Offer {
                data: Sdp { sdp_type: SdpType::Offer, sdp: "v=0\r\n...".to_string() },
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        let back: SignalingEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.from, from);
        assert_eq!(back.to, Some(to));
    }

    #[test]
    fn ping_has_no_data_field() {
        let env = SignalingEnvelope::new(PeerId::random(), None, SignalingMessage::Ping);
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"data\""));
    }
}
