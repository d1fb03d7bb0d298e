//! Gossip envelope: `id`/`ttl`/`path` shape of a propagated message.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::id::PeerId;

/// 128-bit random message identifier, hex-encoded on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct GossipMessageId([u8; 16]);

impl GossipMessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, GossipIdParseError> {
        if s.len() != 32 {
            return Err(GossipIdParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| GossipIdParseError::NotHex)?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GossipIdParseError {
    #[error("gossip message id must be 32 hex chars, got {0}")]
    WrongLength(usize),
    #[error("gossip message id is not valid hex")]
    NotHex,
}

impl fmt::Debug for GossipMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GossipMessageId({})", self.to_hex())
    }
}

impl fmt::Display for GossipMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<GossipMessageId> for String {
    fn from(id: GossipMessageId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for GossipMessageId {
    type Error = GossipIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

/// Gossip subtypes, renamed individually rather than via a blanket case
/// convention: the wire casing is inconsistent (`mediaEvent` is
/// camelCase, the rest are kebab/snake case).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum GossipSubtype {
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "encrypted")]
    Encrypted,
    #[serde(rename = "peer-announcement")]
    PeerAnnouncement,
    #[serde(rename = "dm")]
    Dm,
    #[serde(rename = "dht-routing")]
    DhtRouting,
    #[serde(rename = "mediaEvent")]
    MediaEvent,
    #[serde(rename = "stream-chunk")]
    StreamChunk,
    #[serde(rename = "stream-control")]
    StreamControl,
    #[serde(rename = "key_exchange")]
    KeyExchange,
    #[serde(rename = "key_exchange_response")]
    KeyExchangeResponse,
}

impl GossipSubtype {
    /// `chat`/`encrypted` emit a local receive event immediately on
    /// broadcast.
    pub fn emits_on_broadcast(self) -> bool {
        matches!(self, Self::Chat | Self::Encrypted)
    }

    pub fn is_key_exchange(self) -> bool {
        matches!(self, Self::KeyExchange | Self::KeyExchangeResponse)
    }
}

/// One gossip message: `{id, subtype, content, from,
/// to?, ttl, path, timestamp, network_name?}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: GossipMessageId,
    pub subtype: GossipSubtype,
    pub content: serde_json::Value,
    pub from: PeerId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<PeerId>,
    pub ttl: u32,
    pub path: Vec<PeerId>,
    pub timestamp: u64,
    #[serde(rename = "networkName", skip_serializing_if = "Option::is_none", default)]
    pub network_name: Option<String>,
}

impl GossipMessage {
    /// Originates a new message: `path = [from]`.
    pub fn originate(
        subtype: GossipSubtype,
        content: serde_json::Value,
        from: PeerId,
        to: Option<PeerId>,
        ttl: u32,
        network_name: Option<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: GossipMessageId::random(),
            subtype,
            content,
            from,
            to,
            ttl,
            path: vec![from],
            timestamp,
            network_name,
        }
    }

    pub fn content_is_empty(&self) -> bool {
        match &self.content {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Structural validity: non-nil id/from, ttl representable, path
    /// present. Does not check business rules (dedup, network name).
    pub fn is_well_formed(&self) -> bool {
        self.ttl <= i32::MAX as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_hex() {
        let id = GossipMessageId::random();
        assert_eq!(GossipMessageId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn originate_seeds_path_with_self() {
        let from = PeerId::random();
        let msg = GossipMessage::originate(
            GossipSubtype::Chat,
            serde_json::json!("hi"),
            from,
            None,
            10,
            None,
        );
        assert_eq!(msg.path, vec![from]);
    }
}
