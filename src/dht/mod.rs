//! Consistent-hashing DHT: put/get with gossip-based replication to the
//! closest peers on a 32-bit ring, with an actor-style put/get-with-timeout
//! shape.

pub mod message;

use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::atomic::{AtomicU64, Ordering as AtomicOrdering}};

use futures::{channel::mpsc, FutureExt, StreamExt};
use sha2::{Digest, Sha256};

pub use message::{DhtMessage, DhtRecord};

use crate::{
    clock::{Clock, Instant, Spawner},
    config::DhtConfig,
    events::MeshEvent,
    frame::MeshFrame,
    id::PeerId,
};

/// Narrow interface `Dht` needs to reach connected peers.
/// Implemented by `ConnectionManager`.
pub trait PeerRegistry {
    fn open_channel_peers(&self) -> Vec<PeerId>;
    fn send_frame(&self, peer: PeerId, frame: &MeshFrame);
}

/// 32-bit ring position of a data key: first 4 bytes (big-endian) of its
/// SHA-256 digest.
pub fn key_ring_position(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// 32-bit ring position of a peer: a deterministic non-cryptographic
/// rolling hash (FNV-1a) over its hex string. This algorithm is pinned
/// down precisely rather than left to whatever a crypto hash crate
/// produces, so it is written out in full here.
pub fn peer_ring_position(id: &PeerId) -> u32 {
    let hex = id.to_hex();
    let mut hash: u32 = 0x811c_9dc5;
    for byte in hex.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Circular distance between two ring positions.
pub fn ring_distance(a: u32, b: u32) -> u32 {
    let diff = a.wrapping_sub(b);
    diff.min(u32::MAX - diff + 1)
}

struct StoredRecord {
    record: DhtRecord,
    stored_at: Instant,
}

/// Consistent-hash ring over peer IDs; put/get with replication to the
/// closest peers.
pub struct Dht {
    self_id: PeerId,
    config: DhtConfig,
    clock: Rc<dyn Clock>,
    spawner: Rc<dyn Spawner>,
    peers: Rc<dyn PeerRegistry>,
    storage: RefCell<HashMap<String, StoredRecord>>,
    pending_queries: RefCell<HashMap<u64, mpsc::UnboundedSender<Option<DhtRecord>>>>,
    next_query_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl Dht {
    pub fn new(
        self_id: PeerId,
        config: DhtConfig,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
        peers: Rc<dyn PeerRegistry>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            self_id,
            config,
            clock,
            spawner,
            peers,
            storage: RefCell::new(HashMap::new()),
            pending_queries: RefCell::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
            events_tx,
        });
        this.clone().spawn_ttl_sweep();
        this
    }

    /// Hash position of the local peer on the ring.
    pub fn hash_position(&self) -> u32 {
        peer_ring_position(&self.self_id)
    }

    fn closest_peers(&self, key: &str, n: usize) -> Vec<PeerId> {
        let key_hash = key_ring_position(key);
        let mut candidates: Vec<(u32, PeerId)> = self
            .peers
            .open_channel_peers()
            .into_iter()
            .map(|p| (ring_distance(peer_ring_position(&p), key_hash), p))
            .collect();
        candidates.sort_by_key(|(d, _)| *d);
        candidates.into_iter().take(n).map(|(_, p)| p).collect()
    }

    /// `put`: store locally, replicate fire-and-forget to
    /// the `R` closest connected peers.
    pub fn put(&self, key: String, value: serde_json::Value) {
        let record = DhtRecord { key: key.clone(), value, timestamp: now_ms(), publisher: self.self_id };
        self.storage
            .borrow_mut()
            .insert(key.clone(), StoredRecord { record: record.clone(), stored_at: self.clock.now() });
        let targets = self.closest_peers(&key, self.config.replication_factor);
        for peer in targets {
            self.peers.send_frame(peer, &MeshFrame::Dht { message: DhtMessage::Store { record: record.clone() } });
        }
    }

    /// `get`: local cache hit (unless `force_refresh`),
    /// else query the `R` closest connected peers in parallel with a
    /// per-query timeout, returning the first successful response.
    pub async fn get(self: &Rc<Self>, key: &str, force_refresh: bool) -> Option<DhtRecord> {
        if !force_refresh {
            if let Some(stored) = self.storage.borrow().get(key) {
                return Some(stored.record.clone());
            }
        }

        let targets = self.closest_peers(key, self.config.replication_factor);
        if targets.is_empty() {
            self.emit_value(key, None);
            return None;
        }

        let query_id = self.next_query_id.fetch_add(1, AtomicOrdering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded();
        self.pending_queries.borrow_mut().insert(query_id, tx);
        for peer in &targets {
            self.peers.send_frame(
                *peer,
                &MeshFrame::Dht { message: DhtMessage::Query { key: key.to_string(), query_id } },
            );
        }

        let mut remaining = targets.len();
        let timeout = self.spawner.delay(self.config.query_timeout).fuse();
        futures::pin_mut!(timeout);
        let result = loop {
            futures::select! {
                next = rx.next() => match next {
                    Some(Some(record)) => break Some(record),
                    Some(None) => {
                        remaining -= 1;
                        if remaining == 0 {
                            break None;
                        }
                    }
                    None => break None,
                },
                _ = timeout => break None,
            }
        };
        self.pending_queries.borrow_mut().remove(&query_id);

        if let Some(record) = &result {
            self.storage.borrow_mut().insert(
                key.to_string(),
                StoredRecord { record: record.clone(), stored_at: self.clock.now() },
            );
        }
        self.emit_value(key, result.clone());
        result
    }

    fn emit_value(&self, key: &str, record: Option<DhtRecord>) {
        let _ = self.events_tx.unbounded_send(MeshEvent::DhtValue(key.to_string(), record));
    }

    /// Handles a `dht`-tagged mesh frame or a gossip-routed `dht-routing`
    /// payload.
    pub fn handle_message(&self, from: PeerId, message: DhtMessage) {
        match message {
            DhtMessage::Store { record } => {
                let mut storage = self.storage.borrow_mut();
                let keep_existing = storage
                    .get(&record.key)
                    .is_some_and(|existing| existing.record.timestamp >= record.timestamp);
                if !keep_existing {
                    storage.insert(
                        record.key.clone(),
                        StoredRecord { record, stored_at: self.clock.now() },
                    );
                }
            }
            DhtMessage::Query { key, query_id } => {
                let record = self.storage.borrow().get(&key).map(|s| s.record.clone());
                self.peers
                    .send_frame(from, &MeshFrame::Dht { message: DhtMessage::QueryResponse { query_id, record } });
            }
            DhtMessage::QueryResponse { query_id, record } => {
                if let Some(tx) = self.pending_queries.borrow().get(&query_id) {
                    let _ = tx.unbounded_send(record);
                }
            }
        }
    }

    fn spawn_ttl_sweep(self: Rc<Self>) {
        let this = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            self.config.ttl_sweep_interval,
            Box::new(move || this.sweep_expired()),
        );
    }

    /// Entries older than 24h are pruned locally every 5 minutes.
    fn sweep_expired(&self) {
        let now = self.clock.now();
        let ttl = self.config.entry_ttl;
        self.storage.borrow_mut().retain(|_, stored| now.since(stored.stored_at) < ttl);
    }
}

impl crate::gossip::DhtRoutingSink for Dht {
    fn handle_routed(&self, from: PeerId, message: DhtMessage) {
        self.handle_message(from, message);
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_distance_is_symmetric_and_circular() {
        assert_eq!(ring_distance(10, 20), ring_distance(20, 10));
        assert_eq!(ring_distance(0, u32::MAX), 1);
    }

    #[test]
    fn peer_ring_position_is_deterministic() {
        let id = PeerId::random();
        assert_eq!(peer_ring_position(&id), peer_ring_position(&id));
    }

    #[test]
    fn key_ring_position_is_stable_for_same_key() {
        assert_eq!(key_ring_position("session/42"), key_ring_position("session/42"));
        assert_ne!(key_ring_position("session/42"), key_ring_position("session/43"));
    }

    #[test]
    fn store_keeps_newer_timestamp_on_conflict() {
        let (tx, _rx) = mpsc::unbounded();
        struct NoPeers;
        impl PeerRegistry for NoPeers {
            fn open_channel_peers(&self) -> Vec<PeerId> {
                vec![]
            }
            fn send_frame(&self, _peer: PeerId, _frame: &MeshFrame) {}
        }
        let dht = Dht::new(
            PeerId::random(),
            DhtConfig::default(),
            Rc::new(crate::clock::test_support::TestClock::new()),
            Rc::new(test_spawner()),
            Rc::new(NoPeers),
            tx,
        );
        let publisher = PeerId::random();
        let older =
            DhtRecord { key: "k".into(), value: serde_json::json!(1), timestamp: 100, publisher };
        let newer =
            DhtRecord { key: "k".into(), value: serde_json::json!(2), timestamp: 200, publisher };
        dht.handle_message(publisher, DhtMessage::Store { record: newer.clone() });
        dht.handle_message(publisher, DhtMessage::Store { record: older });
        assert_eq!(dht.storage.borrow().get("k").unwrap().record.value, serde_json::json!(2));
    }

    fn test_spawner() -> impl Spawner {
        struct S;
        impl Spawner for S {
            fn spawn(&self, _fut: futures::future::LocalBoxFuture<'static, ()>) {}
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
        S
    }

    /// A spawner whose `delay` never resolves, so a `get()` racing it
    /// against an already-buffered `QueryResponse` deterministically takes
    /// the response, never the timeout.
    fn never_timeout_spawner() -> impl Spawner {
        struct S;
        impl Spawner for S {
            fn spawn(&self, _fut: futures::future::LocalBoxFuture<'static, ()>) {}
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
                Box::pin(std::future::pending())
            }
        }
        S
    }

    /// Routes `send_frame` calls between a fixed set of `Dht` instances,
    /// standing in for the mesh's connected-peer fabric so replication and
    /// query/response round trips can be exercised without `ConnectionManager`.
    struct Network {
        nodes: RefCell<HashMap<PeerId, Rc<Dht>>>,
    }

    struct NodeRegistry {
        self_id: PeerId,
        network: Rc<Network>,
    }

    impl PeerRegistry for NodeRegistry {
        fn open_channel_peers(&self) -> Vec<PeerId> {
            self.network.nodes.borrow().keys().copied().filter(|p| *p != self.self_id).collect()
        }

        fn send_frame(&self, peer: PeerId, frame: &MeshFrame) {
            if let MeshFrame::Dht { message } = frame {
                if let Some(target) = self.network.nodes.borrow().get(&peer).cloned() {
                    target.handle_message(self.self_id, message.clone());
                }
            }
        }
    }

    /// S4: a `put` on one node replicates to the
    /// `replication_factor` closest peers on the ring; a disjoint node's
    /// `get` returns the value via the first replica that answers.
    #[test]
    fn get_returns_value_from_first_responding_replica_across_a_five_node_ring() {
        let network = Rc::new(Network { nodes: RefCell::new(HashMap::new()) });
        let mut dhts = Vec::new();
        for _ in 0..5 {
            let id = PeerId::random();
            let (tx, _rx) = mpsc::unbounded();
            let registry = Rc::new(NodeRegistry { self_id: id, network: Rc::clone(&network) });
            let dht = Dht::new(
                id,
                DhtConfig::default(),
                Rc::new(crate::clock::test_support::TestClock::new()),
                Rc::new(never_timeout_spawner()),
                registry,
                tx,
            );
            network.nodes.borrow_mut().insert(id, Rc::clone(&dht));
            dhts.push(dht);
        }

        let publisher = Rc::clone(&dhts[0]);
        publisher.put("session/7".into(), serde_json::json!({"room": 7}));

        let key_hash = key_ring_position("session/7");
        let querying_node = dhts
            .iter()
            .filter(|d| d.self_id != publisher.self_id)
            .max_by_key(|d| ring_distance(d.hash_position(), key_hash))
            .expect("at least one other node");

        let fetched = futures::executor::block_on(querying_node.get("session/7", false));
        assert_eq!(fetched.expect("a replica answers the query").value, serde_json::json!({"room": 7}));
    }

    /// A node outside the replication set that never replicated the key
    /// gets back `None` once every replica has answered empty, rather than
    /// hanging until the (never-resolving, in this fixture) timeout.
    #[test]
    fn get_returns_none_once_every_replica_answers_empty() {
        let network = Rc::new(Network { nodes: RefCell::new(HashMap::new()) });
        let mut dhts = Vec::new();
        for _ in 0..4 {
            let id = PeerId::random();
            let (tx, _rx) = mpsc::unbounded();
            let registry = Rc::new(NodeRegistry { self_id: id, network: Rc::clone(&network) });
            let dht = Dht::new(
                id,
                DhtConfig::default(),
                Rc::new(crate::clock::test_support::TestClock::new()),
                Rc::new(never_timeout_spawner()),
                registry,
                tx,
            );
            network.nodes.borrow_mut().insert(id, Rc::clone(&dht));
            dhts.push(dht);
        }

        let fetched = futures::executor::block_on(dhts[0].get("never-published", false));
        assert_eq!(fetched, None);
    }
}
