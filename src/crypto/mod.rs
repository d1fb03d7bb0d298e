//! CryptoManager: keypair lifecycle, per-peer/group authenticated
//! encryption, signing, and gossip-borne key exchange. Built on this
//! crate's `Rc<RefCell<_>>` single-actor model and the leaf-capability
//! traits the rest of this crate uses instead of a shared `mesh`
//! back-reference.

pub mod encryption;
pub mod keys;

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use futures::channel::mpsc;
use sha2::Digest;

pub use encryption::Envelope;
pub use keys::{Keypair, KeypairExport, PublicKeySet};

use crate::{
    clock::{Clock, Spawner},
    connection::KeyExchangeScheduler,
    error::{MeshError, MeshResult},
    events::MeshEvent,
    gossip::{GossipCrypto, GossipSender, GossipSubtype},
    id::PeerId,
};

/// Notified when a peer's keys are learned, so `ConnectionManager` can
/// mark it key-ready without depending on `CryptoManager`'s concrete
/// type.
pub trait KeyHolderNotify {
    fn note_keys_received(&self, peer: PeerId);
}

const MAX_SEEN_NONCES: usize = 1000;

pub struct CryptoManager {
    self_id: PeerId,
    keypair: Keypair,
    clock: Rc<dyn Clock>,
    spawner: Rc<dyn Spawner>,
    peer_keys: RefCell<HashMap<PeerId, PublicKeySet>>,
    group_keys: RefCell<HashMap<String, Keypair>>,
    seen_nonces: RefCell<HashSet<String>>,
    gossip: RefCell<Option<Rc<dyn GossipSender>>>,
    key_holder: RefCell<Option<Rc<dyn KeyHolderNotify>>>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl CryptoManager {
    pub fn new(
        self_id: PeerId,
        keypair: Keypair,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            self_id,
            keypair,
            clock,
            spawner,
            peer_keys: RefCell::new(HashMap::new()),
            group_keys: RefCell::new(HashMap::new()),
            seen_nonces: RefCell::new(HashSet::new()),
            gossip: RefCell::new(None),
            key_holder: RefCell::new(None),
            events_tx,
        });
        this.clone().spawn_nonce_sweep();
        this
    }

    pub fn bind_gossip(&self, gossip: Rc<dyn GossipSender>) {
        *self.gossip.borrow_mut() = Some(gossip);
    }

    pub fn bind_key_holder(&self, holder: Rc<dyn KeyHolderNotify>) {
        *self.key_holder.borrow_mut() = Some(holder);
    }

    /// Breaks the `CryptoManager` ↔ `GossipManager`/`ConnectionManager`
    /// `Rc` cycles via explicit manual disposal.
    pub fn dispose(&self) {
        *self.gossip.borrow_mut() = None;
        *self.key_holder.borrow_mut() = None;
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    /// Our own `{pub, epub, timestamp}`, sent in `key_exchange` gossip.
    pub fn public_set(&self) -> PublicKeySet {
        self.keypair.public_set(now_ms())
    }

    pub fn export_keypair(&self) -> KeypairExport {
        self.keypair.export()
    }

    /// Records a peer's advertised keys. Returns `false` if this is a
    /// duplicate of what we already have (identical `pub`/`epub`),
    /// matching CryptoManager-level dedup.
    pub fn add_peer_key(&self, peer: PeerId, keys: PublicKeySet) -> bool {
        let mut peer_keys = self.peer_keys.borrow_mut();
        if peer_keys.get(&peer).is_some_and(|existing| *existing == keys) {
            return false;
        }
        peer_keys.insert(peer, keys);
        drop(peer_keys);
        if let Some(holder) = self.key_holder.borrow().clone() {
            holder.note_keys_received(peer);
        }
        true
    }

    pub fn has_peer_key(&self, peer: PeerId) -> bool {
        self.peer_keys.borrow().contains_key(&peer)
    }

    /// `encrypt_for_peer(msg, peer)`.
    pub fn encrypt_for_peer(&self, peer: PeerId, msg: &serde_json::Value) -> MeshResult<Envelope> {
        let peer_epub = {
            let peer_keys = self.peer_keys.borrow();
            let keys = peer_keys
                .get(&peer)
                .ok_or_else(|| MeshError::Crypto(format!("no key held for peer {peer}")))?;
            keys::parse_enc_pub(&keys.enc_pub)?
        };
        let shared_key = encryption::derive_shared_key(self.keypair.enc_secret(), &peer_epub);
        self.seal(&shared_key, msg)
    }

    /// Decrypts a message from `peer`, rejecting replayed nonces.
    pub fn decrypt_from_peer(
        &self,
        peer: PeerId,
        env: &Envelope,
    ) -> MeshResult<serde_json::Value> {
        if self.seen_nonces.borrow().contains(&env.nonce) {
            return Err(MeshError::ReplayDetected);
        }
        let peer_epub = {
            let peer_keys = self.peer_keys.borrow();
            let keys = peer_keys
                .get(&peer)
                .ok_or_else(|| MeshError::Crypto(format!("no key held for peer {peer}")))?;
            keys::parse_enc_pub(&keys.enc_pub)?
        };
        let shared_key = encryption::derive_shared_key(self.keypair.enc_secret(), &peer_epub);
        let value = self.open(&shared_key, env)?;
        self.record_nonce(env.nonce.clone());
        Ok(value)
    }

    /// Group encryption: symmetric in shape, keyed by a generated group
    /// keypair rather than a per-pair ECDH.
    pub fn encrypt_for_group(
        &self,
        group_id: &str,
        msg: &serde_json::Value,
    ) -> MeshResult<Envelope> {
        let group_key = self.group_symmetric_key(group_id);
        self.seal(&group_key, msg)
    }

    pub fn decrypt_for_group(
        &self,
        group_id: &str,
        env: &Envelope,
    ) -> MeshResult<serde_json::Value> {
        if self.seen_nonces.borrow().contains(&env.nonce) {
            return Err(MeshError::ReplayDetected);
        }
        let group_key = self.group_symmetric_key(group_id);
        let value = self.open(&group_key, env)?;
        self.record_nonce(env.nonce.clone());
        Ok(value)
    }

    /// Loads (or overwrites) a group's shared key, e.g. distributed to
    /// members out of band.
    pub fn set_group_key(&self, group_id: String, export: &KeypairExport) -> MeshResult<()> {
        let keypair = Keypair::from_export(export)?;
        self.group_keys.borrow_mut().insert(group_id, keypair);
        Ok(())
    }

    pub fn export_group_key(&self, group_id: &str) -> Option<KeypairExport> {
        self.group_keys.borrow().get(group_id).map(Keypair::export)
    }

    fn group_symmetric_key(&self, group_id: &str) -> [u8; 32] {
        let mut group_keys = self.group_keys.borrow_mut();
        let keypair = group_keys.entry(group_id.to_string()).or_insert_with(Keypair::generate);
        sha2::Sha256::digest(keypair.enc_secret().to_bytes()).into()
    }

    /// Detached signature over the canonical serialization.
    pub fn sign(&self, data: &[u8]) -> String {
        self.keypair.sign(data)
    }

    pub fn verify(&self, sign_pub_hex: &str, data: &[u8], signature_hex: &str) -> bool {
        keys::verify(sign_pub_hex, data, signature_hex)
    }

    fn seal(&self, key: &[u8; 32], msg: &serde_json::Value) -> MeshResult<Envelope> {
        let plaintext =
            serde_json::to_vec(msg).map_err(|e| MeshError::Crypto(e.to_string()))?;
        let timestamp = now_ms();
        let wire_nonce = encryption::generate_wire_nonce(timestamp);
        let aead_nonce = encryption::derive_aead_nonce(&wire_nonce);
        let ciphertext = encryption::encrypt(key, &aead_nonce, &plaintext)?;
        Ok(Envelope {
            encrypted: true,
            data: hex::encode(ciphertext),
            from: self.keypair.public_set(timestamp).sign_pub,
            nonce: wire_nonce,
            timestamp,
        })
    }

    fn open(&self, key: &[u8; 32], env: &Envelope) -> MeshResult<serde_json::Value> {
        let ciphertext = hex::decode(&env.data).map_err(|e| MeshError::Crypto(e.to_string()))?;
        let aead_nonce = encryption::derive_aead_nonce(&env.nonce);
        let plaintext = encryption::decrypt(key, &aead_nonce, &ciphertext)?;
        serde_json::from_slice(&plaintext).map_err(|e| MeshError::Crypto(e.to_string()))
    }

    fn record_nonce(&self, nonce: String) {
        let mut seen = self.seen_nonces.borrow_mut();
        if seen.len() >= MAX_SEEN_NONCES {
            seen.clear();
        }
        seen.insert(nonce);
    }

    fn spawn_nonce_sweep(self: Rc<Self>) {
        let this = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            std::time::Duration::from_secs(60),
            Box::new(move || this.sweep_nonce_cap()),
        );
    }

    /// Backstop for the `record_nonce` cap: "crypto nonce
    /// cap sweep (60s)" timer.
    fn sweep_nonce_cap(&self) {
        let mut seen = self.seen_nonces.borrow_mut();
        if seen.len() >= MAX_SEEN_NONCES {
            seen.clear();
        }
    }
}

impl GossipCrypto for CryptoManager {
    fn decrypt(&self, from: PeerId, content: &serde_json::Value) -> Option<serde_json::Value> {
        let env: Envelope = serde_json::from_value(content.clone()).ok()?;
        self.decrypt_from_peer(from, &env).ok()
    }

    fn handle_key_exchange(&self, from: PeerId, is_response: bool, content: serde_json::Value) {
        let Ok(keys) = serde_json::from_value::<PublicKeySet>(content) else { return };
        let added = self.add_peer_key(from, keys);
        if added && !is_response {
            if let Some(gossip) = self.gossip.borrow().clone() {
                let content = serde_json::to_value(self.public_set())
                    .unwrap_or(serde_json::Value::Null);
                gossip.send_direct(from, GossipSubtype::KeyExchangeResponse, content);
            }
        }
    }
}

impl KeyExchangeScheduler for CryptoManager {
    /// Sends our own `{pub, epub, timestamp}` as a `key_exchange` gossip
    /// message, asynchronously so it never blocks `DataChannelOpen`.
    fn schedule_key_exchange(&self, peer: PeerId) {
        let Some(gossip) = self.gossip.borrow().clone() else { return };
        let content = serde_json::to_value(self.public_set()).unwrap_or(serde_json::Value::Null);
        self.spawner.spawn(Box::pin(async move {
            gossip.send_direct(peer, GossipSubtype::KeyExchange, content);
        }));
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::TestClock;

    struct ImmediateSpawner;
    impl Spawner for ImmediateSpawner {
        fn spawn(&self, fut: futures::future::LocalBoxFuture<'static, ()>) {
            drop(fut);
        }
        fn spawn_interval(
            &self,
            _period: std::time::Duration,
            _f: Box<dyn Fn()>,
        ) -> Box<dyn crate::clock::IntervalHandle> {
            struct H;
            impl crate::clock::IntervalHandle for H {
                fn cancel(self: Box<Self>) {}
            }
            Box::new(H)
        }
        fn delay(
            &self,
            _dur: std::time::Duration,
        ) -> futures::future::LocalBoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn make_manager(id: PeerId) -> (Rc<CryptoManager>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let manager = CryptoManager::new(
            id,
            Keypair::generate(),
            Rc::new(TestClock::new()),
            Rc::new(ImmediateSpawner),
            tx,
        );
        (manager, rx)
    }

    #[test]
    fn peer_encryption_round_trips() {
        let alice_id = PeerId::random();
        let bob_id = PeerId::random();
        let (alice, _) = make_manager(alice_id);
        let (bob, _) = make_manager(bob_id);

        alice.add_peer_key(bob_id, bob.public_set());
        bob.add_peer_key(alice_id, alice.public_set());

        let envelope = alice.encrypt_for_peer(bob_id, &serde_json::json!({"hi": "there"})).unwrap();
        let decrypted = bob.decrypt_from_peer(alice_id, &envelope).unwrap();
        assert_eq!(decrypted, serde_json::json!({"hi": "there"}));
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let alice_id = PeerId::random();
        let bob_id = PeerId::random();
        let (alice, _) = make_manager(alice_id);
        let (bob, _) = make_manager(bob_id);
        alice.add_peer_key(bob_id, bob.public_set());
        bob.add_peer_key(alice_id, alice.public_set());

        let envelope = alice.encrypt_for_peer(bob_id, &serde_json::json!("once")).unwrap();
        assert!(bob.decrypt_from_peer(alice_id, &envelope).is_ok());
        assert!(matches!(
            bob.decrypt_from_peer(alice_id, &envelope),
            Err(MeshError::ReplayDetected)
        ));
    }

    #[test]
    fn duplicate_key_exchange_is_not_re_added() {
        let (manager, _) = make_manager(PeerId::random());
        let peer = PeerId::random();
        let keys = PublicKeySet { sign_pub: "aa".repeat(32), enc_pub: "bb".repeat(32), timestamp: 1 };
        assert!(manager.add_peer_key(peer, keys.clone()));
        assert!(!manager.add_peer_key(peer, keys));
    }

    #[test]
    fn group_encryption_round_trips_for_members_with_same_key() {
        let (alice, _) = make_manager(PeerId::random());
        let (bob, _) = make_manager(PeerId::random());
        let export = alice.group_keys.borrow_mut().entry("room".to_string()).or_insert_with(Keypair::generate).export();
        bob.set_group_key("room".to_string(), &export).unwrap();

        let envelope = alice.encrypt_for_group("room", &serde_json::json!("group hi")).unwrap();
        assert_eq!(bob.decrypt_for_group("room", &envelope).unwrap(), serde_json::json!("group hi"));
    }
}
