//! Mesh/data-channel frame format.
//!
//! Uses the same `#[serde(tag = ...)]` pattern as the signaling protocol,
//! reused for the peer-to-peer data channel instead of the signaling
//! websocket. Filtered variants (`SignalingRelay` and its siblings) carry
//! an opaque JSON payload: the original multi-hub bootstrap relay chatter
//! they correspond to is processed internally and never surfaced, so
//! `ConnectionManager` logs and drops them rather than interpreting a
//! shape it never needs to act on.

use serde::{Deserialize, Serialize};

use crate::{dht::message::DhtMessage, gossip::message::GossipMessage, transport::Sdp};

/// Top-level frame carried over an open data channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MeshFrame {
    Gossip {
        #[serde(flatten)]
        message: GossipMessage,
    },
    Dht {
        #[serde(flatten)]
        message: DhtMessage,
    },
    Eviction,
    /// Signaling-over-mesh: a signaling envelope relayed across an open
    /// data channel for a peer without direct signaling access.
    Signaling {
        data: serde_json::Value,
    },
    SignalingRelay {
        #[serde(default, flatten)]
        data: serde_json::Map<String, serde_json::Value>,
    },
    PeerAnnounceRelay {
        #[serde(default, flatten)]
        data: serde_json::Map<String, serde_json::Value>,
    },
    BootstrapKeepalive,
    ClientPeerAnnouncement {
        #[serde(default, flatten)]
        data: serde_json::Map<String, serde_json::Value>,
    },
    CrossBootstrapSignaling {
        #[serde(default, flatten)]
        data: serde_json::Map<String, serde_json::Value>,
    },
    RenegotiationOffer {
        data: Sdp,
    },
    RenegotiationAnswer {
        data: Sdp,
    },
    Binary {
        data: Vec<u8>,
        size: usize,
    },
}

impl MeshFrame {
    /// True for frame kinds processed internally but never surfaced as
    /// application messages.
    pub fn is_filtered(&self) -> bool {
        matches!(
            self,
            Self::Signaling { .. }
                | Self::SignalingRelay { .. }
                | Self::PeerAnnounceRelay { .. }
                | Self::BootstrapKeepalive
                | Self::ClientPeerAnnouncement { .. }
                | Self::CrossBootstrapSignaling { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_is_kebab_case() {
        let json = serde_json::to_value(MeshFrame::BootstrapKeepalive).unwrap();
        assert_eq!(json["type"], "bootstrap-keepalive");
    }

    #[test]
    fn eviction_and_keepalive_round_trip_with_no_payload() {
        for frame in [MeshFrame::Eviction, MeshFrame::BootstrapKeepalive] {
            let json = serde_json::to_string(&frame).unwrap();
            let back: MeshFrame = serde_json::from_str(&json).unwrap();
            assert_eq!(
                std::mem::discriminant(&frame),
                std::mem::discriminant(&back)
            );
        }
    }

    #[test]
    fn relay_variants_are_filtered_but_gossip_and_dht_are_not() {
        assert!(MeshFrame::BootstrapKeepalive.is_filtered());
        assert!(MeshFrame::Signaling { data: serde_json::json!({}) }.is_filtered());
        assert!(MeshFrame::SignalingRelay { data: Default::default() }.is_filtered());
        assert!(MeshFrame::PeerAnnounceRelay { data: Default::default() }.is_filtered());
        assert!(MeshFrame::ClientPeerAnnouncement { data: Default::default() }.is_filtered());
        assert!(MeshFrame::CrossBootstrapSignaling { data: Default::default() }.is_filtered());
        assert!(!MeshFrame::Eviction.is_filtered());
        assert!(!MeshFrame::Binary { data: vec![1, 2, 3], size: 3 }.is_filtered());
    }

    #[test]
    fn unknown_relay_fields_deserialize_into_the_flattened_map() {
        let json = serde_json::json!({
            "type": "signaling-relay",
            "from": "aaaa",
            "nested": {"a": 1},
        });
        let frame: MeshFrame = serde_json::from_value(json).unwrap();
        match frame {
            MeshFrame::SignalingRelay { data } => {
                assert_eq!(data.get("from").unwrap(), "aaaa");
                assert!(data.contains_key("nested"));
            }
            other => panic!("expected SignalingRelay, got {other:?}"),
        }
    }
}
