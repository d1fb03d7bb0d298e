//! 160-bit peer identity.
//!
//! Rendered as 40 lowercase hex characters; ordered lexicographically by
//! that hex string, and XOR-compared byte-wise over the raw 20 bytes.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

/// Raw byte width of a [`PeerId`] (160 bits).
pub const PEER_ID_LEN: usize = 20;

/// A peer's identity: 160 random (or derived) bits.
///
/// `Eq`/`Hash` are over the raw bytes; `Ord`/`PartialOrd` are over the
/// lowercase-hex rendering,  ("total ordering is the
/// lexicographic order of the hex string").
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Builds a [`PeerId`] from raw bytes.
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generates a random [`PeerId`].
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Raw byte view of this identity.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, used both for `Display` and for the total
    /// order requires.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 40-character lowercase hex string into a [`PeerId`].
    pub fn from_hex(s: &str) -> Result<Self, PeerIdParseError> {
        if s.len() != PEER_ID_LEN * 2 {
            return Err(PeerIdParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| PeerIdParseError::NotHex)?;
        Ok(Self(bytes))
    }

    /// Byte-wise XOR distance to `other`, used by both gossip routing and
    /// discovery ordering.
    pub fn xor_distance(&self, other: &Self) -> [u8; PEER_ID_LEN] {
        let mut out = [0u8; PEER_ID_LEN];
        for i in 0..PEER_ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// First 8 hex characters, used in short human-readable status
    /// messages (, "short peer-id prefixes").
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

/// Error returned by [`PeerId::from_hex`].
#[derive(Debug, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("peer id must be {} hex chars, got {0}", PEER_ID_LEN * 2)]
    WrongLength(usize),
    #[error("peer id is not valid hex")]
    NotHex,
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_hex().cmp(&other.to_hex())
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

/// Compares two XOR distances lexicographically (big-endian byte order),
/// the ordering used everywhere "closest by XOR distance" is required.
pub fn closer(a: &[u8; PEER_ID_LEN], b: &[u8; PEER_ID_LEN]) -> Ordering {
    a.cmp(b)
}
