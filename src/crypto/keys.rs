//! Keypair lifecycle: a signing keypair (`ed25519-dalek`) and an
//! encryption keypair (`x25519-dalek`), exported/imported as raw hex so a
//! host can persist them under a name/password or a `peerpigeon-<id>`
//! alias.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{MeshError, MeshResult};

/// A node's (or group's) full keypair: signing + encryption halves.
#[derive(Clone)]
pub struct Keypair {
    pub(super) signing: SigningKey,
    pub(super) verifying: VerifyingKey,
    pub(super) secret: StaticSecret,
    pub(super) public: XPublicKey,
}

impl Keypair {
    /// Generates a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = XPublicKey::from(&secret);
        Self { signing, verifying, secret, public }
    }

    /// Rebuilds a keypair from its exported raw secrets.
    pub fn from_export(export: &KeypairExport) -> MeshResult<Self> {
        let signing_bytes = decode_32(&export.signing_secret)?;
        let x25519_bytes = decode_32(&export.x25519_secret)?;
        let signing = SigningKey::from_bytes(&signing_bytes);
        let verifying = signing.verifying_key();
        let secret = StaticSecret::from(x25519_bytes);
        let public = XPublicKey::from(&secret);
        Ok(Self { signing, verifying, secret, public })
    }

    /// Exports the raw private material for persistence.
    pub fn export(&self) -> KeypairExport {
        KeypairExport {
            signing_secret: hex::encode(self.signing.to_bytes()),
            x25519_secret: hex::encode(self.secret.to_bytes()),
        }
    }

    /// The `{pub, epub}` pair advertised in a `key_exchange` message.
    pub fn public_set(&self, timestamp: u64) -> PublicKeySet {
        PublicKeySet {
            sign_pub: hex::encode(self.verifying.to_bytes()),
            enc_pub: hex::encode(self.public.to_bytes()),
            timestamp,
        }
    }

    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing.sign(data).to_bytes())
    }

    pub fn enc_secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// Verifies a detached signature against a raw hex signing public key.
pub fn verify(sign_pub_hex: &str, data: &[u8], signature_hex: &str) -> bool {
    let Ok(pub_bytes) = decode_32(sign_pub_hex) else { return false };
    let Ok(verifying) = VerifyingKey::from_bytes(&pub_bytes) else { return false };
    let Ok(sig_bytes) = hex::decode(signature_hex) else { return false };
    let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying.verify(data, &signature).is_ok()
}

/// Parses a peer's hex-encoded X25519 public key out of a [`PublicKeySet`].
pub fn parse_enc_pub(hex_str: &str) -> MeshResult<XPublicKey> {
    decode_32(hex_str).map(XPublicKey::from)
}

fn decode_32(hex_str: &str) -> MeshResult<[u8; 32]> {
    let bytes = hex::decode(hex_str).map_err(|e| MeshError::Crypto(e.to_string()))?;
    bytes.try_into().map_err(|_| MeshError::Crypto("expected 32-byte key".to_string()))
}

/// Raw exported private key material, zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeypairExport {
    pub signing_secret: String,
    pub x25519_secret: String,
}

/// The public half of a [`Keypair`], exchanged over gossip's
/// `key_exchange`/`key_exchange_response`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PublicKeySet {
    #[serde(rename = "pub")]
    pub sign_pub: String,
    #[serde(rename = "epub")]
    pub enc_pub: String,
    pub timestamp: u64,
}
