//! GossipManager: broadcast and direct-message propagation with
//! dedup/TTL/path; XOR routing for directed messages. The seen-set +
//! retention-window dedup runs over a sync `RefCell`-backed table rather
//! than an async lock, matching this crate's single-actor-per-node
//! model.

pub mod message;

use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use futures::channel::mpsc;
use tracing::debug;

pub use message::{GossipIdParseError, GossipMessage, GossipMessageId, GossipSubtype};

use crate::{
    clock::{Clock, Instant, Spawner},
    config::GossipConfig,
    error::{MeshError, MeshResult},
    events::MeshEvent,
    frame::MeshFrame,
    id::{closer, PeerId},
};

/// What a gossip-addressed message resolved to when delivered locally.
#[derive(Clone, Debug)]
pub struct GossipReceive {
    pub id: GossipMessageId,
    pub subtype: GossipSubtype,
    pub from: PeerId,
    pub content: serde_json::Value,
}

/// Narrow interface `GossipManager` needs to reach open data channels,
/// breaking the shared-`mesh`-back-reference into a leaf capability.
/// Implemented by `ConnectionManager`.
pub trait PeerRegistry {
    fn open_channel_peers(&self) -> Vec<PeerId>;
    fn send_frame(&self, peer: PeerId, frame: &MeshFrame);
}

/// `peer-announcement` subtype forwards here. Implemented by
/// `PeerDiscovery`.
pub trait PeerAnnouncementSink {
    fn on_peer_announcement(&self, peer: PeerId);
}

/// `dht-routing` subtype addressed to us hands its content here.
/// Implemented by `Dht`.
pub trait DhtRoutingSink {
    fn handle_routed(&self, from: PeerId, message: crate::dht::message::DhtMessage);
}

/// `key_exchange`/`key_exchange_response` and `encrypted` subtypes route
/// here. Implemented by `CryptoManager`.
pub trait GossipCrypto {
    /// Decrypts an `encrypted` envelope. `None` on any crypto failure —
    /// the frame is dropped, not retried.
    fn decrypt(&self, from: PeerId, content: &serde_json::Value) -> Option<serde_json::Value>;
    fn handle_key_exchange(&self, from: PeerId, is_response: bool, content: serde_json::Value);
}

/// Lets `CryptoManager` originate key-exchange gossip without depending
/// on the concrete `GossipManager` type.
pub trait GossipSender {
    fn send_direct(&self, to: PeerId, subtype: GossipSubtype, content: serde_json::Value);
}

struct SeenEntry {
    received_at: Instant,
}

struct KeyExchangeDedup {
    exact: HashMap<(PeerId, GossipSubtype, u64), Instant>,
    last_of_kind: HashMap<(PeerId, GossipSubtype), Instant>,
}

/// Epidemic broadcast + XOR-routed direct delivery over every open data
/// channel.
pub struct GossipManager {
    self_id: PeerId,
    config: GossipConfig,
    clock: Rc<dyn Clock>,
    spawner: Rc<dyn Spawner>,
    peers: Rc<dyn PeerRegistry>,
    discovery: RefCell<Option<Rc<dyn PeerAnnouncementSink>>>,
    dht: RefCell<Option<Rc<dyn DhtRoutingSink>>>,
    crypto: RefCell<Option<Rc<dyn GossipCrypto>>>,
    seen: RefCell<HashMap<GossipMessageId, SeenEntry>>,
    history: RefCell<HashMap<GossipMessageId, GossipMessage>>,
    key_exchange_dedup: RefCell<KeyExchangeDedup>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl GossipManager {
    pub fn new(
        self_id: PeerId,
        config: GossipConfig,
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
            discovery: RefCell::new(None),
            dht: RefCell::new(None),
            crypto: RefCell::new(None),
            seen: RefCell::new(HashMap::new()),
            history: RefCell::new(HashMap::new()),
            key_exchange_dedup: RefCell::new(KeyExchangeDedup {
                exact: HashMap::new(),
                last_of_kind: HashMap::new(),
            }),
            events_tx,
        });
        this.clone().spawn_cleanup();
        this
    }

    pub fn bind_discovery(&self, sink: Rc<dyn PeerAnnouncementSink>) {
        *self.discovery.borrow_mut() = Some(sink);
    }

    pub fn bind_dht(&self, sink: Rc<dyn DhtRoutingSink>) {
        *self.dht.borrow_mut() = Some(sink);
    }

    pub fn bind_crypto(&self, crypto: Rc<dyn GossipCrypto>) {
        *self.crypto.borrow_mut() = Some(crypto);
    }

    /// Breaks the `GossipManager` ↔ `CryptoManager`/`PeerDiscovery`/`Dht`
    /// `Rc` cycles via explicit manual disposal.
    pub fn dispose(&self) {
        *self.discovery.borrow_mut() = None;
        *self.dht.borrow_mut() = None;
        *self.crypto.borrow_mut() = None;
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    fn record(&self, msg: &GossipMessage) {
        self.seen.borrow_mut().insert(msg.id, SeenEntry { received_at: self.clock.now() });
        self.history.borrow_mut().insert(msg.id, msg.clone());
    }

    fn deliver(&self, msg: &GossipMessage, content: serde_json::Value) {
        self.emit(MeshEvent::GossipReceived(GossipReceive {
            id: msg.id,
            subtype: msg.subtype,
            from: msg.from,
            content,
        }));
    }

    // ---- origination ----

    /// `broadcast(content, subtype)`: path=[self], stored, sent on every
    /// open channel; `chat`/`encrypted` echo a local receive immediately.
    pub fn broadcast(
        &self,
        content: serde_json::Value,
        subtype: GossipSubtype,
    ) -> MeshResult<GossipMessageId> {
        let msg = GossipMessage::originate(
            subtype,
            content.clone(),
            self.self_id,
            None,
            self.config.max_ttl,
            self.config.network_name.clone(),
        );
        if subtype == GossipSubtype::Chat && msg.content_is_empty() {
            return Err(MeshError::Validation("empty chat broadcast refused".to_string()));
        }
        self.record(&msg);
        for peer in self.peers.open_channel_peers() {
            self.peers.send_frame(peer, &MeshFrame::Gossip { message: msg.clone() });
        }
        if subtype.emits_on_broadcast() {
            self.deliver(&msg, content);
        }
        Ok(msg.id)
    }

    /// `dm`/`dht-routing`: same envelope shape with `to` set, delivered by
    /// XOR routing.
    pub fn send_directed(
        &self,
        to: PeerId,
        content: serde_json::Value,
        subtype: GossipSubtype,
    ) -> GossipMessageId {
        let msg = GossipMessage::originate(
            subtype,
            content,
            self.self_id,
            Some(to),
            self.config.max_ttl,
            self.config.network_name.clone(),
        );
        let id = msg.id;
        self.record(&msg);
        self.route(msg, None);
        id
    }

    /// XOR routing: forward to the single neighbour whose
    /// PeerId is closest to `to` (ties forward to all tied neighbours); if
    /// none is closer than self, flood every capable neighbour except the
    /// sender; if there are none at all, the message is silently dropped
    /// (`RouteUnreachable`).
    fn route(&self, msg: GossipMessage, exclude: Option<PeerId>) {
        if msg.ttl == 0 {
            return;
        }
        let Some(to) = msg.to else { return };
        let candidates: Vec<PeerId> = self
            .peers
            .open_channel_peers()
            .into_iter()
            .filter(|p| Some(*p) != exclude)
            .collect();
        if candidates.is_empty() {
            debug!(target = %to, "directed gossip has no route, dropping");
            return;
        }

        let self_distance = self.self_id.xor_distance(&to);
        let mut best_distance: Option<[u8; crate::id::PEER_ID_LEN]> = None;
        let mut closest: Vec<PeerId> = Vec::new();
        for peer in &candidates {
            let distance = peer.xor_distance(&to);
            if closer(&distance, &self_distance) != Ordering::Less {
                continue;
            }
            match &best_distance {
                None => {
                    best_distance = Some(distance);
                    closest = vec![*peer];
                }
                Some(best) => match closer(&distance, best) {
                    Ordering::Less => {
                        best_distance = Some(distance);
                        closest = vec![*peer];
                    }
                    Ordering::Equal => closest.push(*peer),
                    Ordering::Greater => {}
                },
            }
        }

        let targets = if closest.is_empty() { candidates } else { closest };
        for peer in targets {
            self.peers.send_frame(peer, &MeshFrame::Gossip { message: msg.clone() });
        }
    }

    /// Flood to every open channel except `exclude` — the fallback path
    /// for undirected (`to = None`) messages during relay.
    fn flood(&self, msg: GossipMessage, exclude: Option<PeerId>) {
        for peer in self.peers.open_channel_peers() {
            if Some(peer) == exclude {
                continue;
            }
            self.peers.send_frame(peer, &MeshFrame::Gossip { message: msg.clone() });
        }
    }

    // ---- receive path ----

    /// Dedup, TTL, and loop checks, then dispatch by subtype and relay
    /// onward unless the subtype consumed the message locally.
    pub fn handle_incoming(&self, from: PeerId, msg: GossipMessage) {
        if !msg.is_well_formed() {
            debug!(peer = %from, "dropped malformed gossip message");
            return;
        }
        if msg.network_name != self.config.network_name {
            return;
        }
        if self.seen.borrow().contains_key(&msg.id) {
            return;
        }
        if msg.ttl == 0 {
            return;
        }
        if msg.path.contains(&self.self_id) {
            return;
        }
        self.record(&msg);

        let consumed = match msg.subtype {
            GossipSubtype::Chat => {
                self.deliver(&msg, msg.content.clone());
                false
            }
            GossipSubtype::Encrypted => {
                if let Some(crypto) = self.crypto.borrow().clone() {
                    if let Some(plain) = crypto.decrypt(msg.from, &msg.content) {
                        self.deliver(&msg, plain);
                    }
                }
                msg.to == Some(self.self_id)
            }
            GossipSubtype::PeerAnnouncement => {
                if let Some(sink) = self.discovery.borrow().clone() {
                    if let Ok(peer) = serde_json::from_value::<PeerId>(msg.content.clone()) {
                        sink.on_peer_announcement(peer);
                    }
                }
                false
            }
            GossipSubtype::Dm => {
                if msg.to == Some(self.self_id) {
                    self.deliver(&msg, msg.content.clone());
                    true
                } else {
                    false
                }
            }
            GossipSubtype::DhtRouting => {
                if msg.to == Some(self.self_id) {
                    if let Some(sink) = self.dht.borrow().clone() {
                        if let Ok(dht_msg) = serde_json::from_value(msg.content.clone()) {
                            sink.handle_routed(msg.from, dht_msg);
                        }
                    }
                    true
                } else {
                    false
                }
            }
            GossipSubtype::MediaEvent
            | GossipSubtype::StreamChunk
            | GossipSubtype::StreamControl => {
                self.deliver(&msg, msg.content.clone());
                false
            }
            GossipSubtype::KeyExchange | GossipSubtype::KeyExchangeResponse => {
                self.handle_key_exchange(&msg);
                true
            }
        };

        if !consumed {
            let mut next = msg.clone();
            next.ttl -= 1;
            next.path.push(self.self_id);
            if next.to.is_some() {
                self.route(next, Some(from));
            } else {
                self.flood(next, Some(from));
            }
        }
    }

    /// Dedup per `(peer, kind, ts)` plus a 5s window per `(peer, kind)`.
    /// Never relayed regardless.
    fn handle_key_exchange(&self, msg: &GossipMessage) {
        let now = self.clock.now();
        let exact_key = (msg.from, msg.subtype, msg.timestamp);
        let kind_key = (msg.from, msg.subtype);
        {
            let dedup = self.key_exchange_dedup.borrow();
            if dedup.exact.contains_key(&exact_key) {
                return;
            }
            if let Some(last) = dedup.last_of_kind.get(&kind_key) {
                if now.since(*last) < self.config.key_exchange_dedup_window {
                    return;
                }
            }
        }
        {
            let mut dedup = self.key_exchange_dedup.borrow_mut();
            dedup.exact.insert(exact_key, now);
            dedup.last_of_kind.insert(kind_key, now);
        }
        if let Some(crypto) = self.crypto.borrow().clone() {
            let is_response = msg.subtype == GossipSubtype::KeyExchangeResponse;
            crypto.handle_key_exchange(msg.from, is_response, msg.content.clone());
        }
    }

    fn spawn_cleanup(self: Rc<Self>) {
        let this = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            self.config.cleanup_interval,
            Box::new(move || this.cleanup()),
        );
    }

    /// Every minute drops `seen`/`history` older than 5 minutes and
    /// key-exchange dedup entries older than 1 minute.
    fn cleanup(&self) {
        let now = self.clock.now();
        let expiry = self.config.expiry;
        let retention = self.config.key_exchange_dedup_retention;

        let mut seen = self.seen.borrow_mut();
        seen.retain(|_, entry| now.since(entry.received_at) < expiry);
        let live: HashSet<GossipMessageId> = seen.keys().copied().collect();
        drop(seen);
        self.history.borrow_mut().retain(|id, _| live.contains(id));

        let mut dedup = self.key_exchange_dedup.borrow_mut();
        dedup.exact.retain(|_, at| now.since(*at) < retention);
        dedup.last_of_kind.retain(|_, at| now.since(*at) < retention);
    }
}

impl GossipSender for GossipManager {
    fn send_direct(&self, to: PeerId, subtype: GossipSubtype, content: serde_json::Value) {
        let _ = self.send_directed(to, content, subtype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::TestClock;
    use std::cell::RefCell as StdRefCell;

    struct FakeRegistry {
        peers: Vec<PeerId>,
        sent: StdRefCell<Vec<(PeerId, GossipMessageId)>>,
    }

    impl PeerRegistry for FakeRegistry {
        fn open_channel_peers(&self) -> Vec<PeerId> {
            self.peers.clone()
        }

        fn send_frame(&self, peer: PeerId, frame: &MeshFrame) {
            if let MeshFrame::Gossip { message } = frame {
                self.sent.borrow_mut().push((peer, message.id));
            }
        }
    }

    struct ImmediateSpawner;
    impl Spawner for ImmediateSpawner {
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
        fn delay(&self, _dur: std::time::Duration) -> futures::future::LocalBoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn make_gossip(peers: Vec<PeerId>) -> (Rc<GossipManager>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let registry = Rc::new(FakeRegistry { peers, sent: StdRefCell::new(Vec::new()) });
        let gm = GossipManager::new(
            PeerId::random(),
            GossipConfig::default(),
            Rc::new(TestClock::new()),
            Rc::new(ImmediateSpawner),
            registry,
            tx,
        );
        (gm, rx)
    }

    #[test]
    fn empty_chat_broadcast_is_refused() {
        let (gm, _rx) = make_gossip(vec![]);
        let err = gm.broadcast(serde_json::json!(""), GossipSubtype::Chat);
        assert!(matches!(err, Err(MeshError::Validation(_))));
    }

    #[test]
    fn dm_addressed_to_self_is_not_relayed() {
        let (gm, mut rx) = make_gossip(vec![PeerId::random()]);
        let msg = GossipMessage::originate(
            GossipSubtype::Dm,
            serde_json::json!("hi"),
            PeerId::random(),
            Some(gm.self_id),
            10,
            None,
        );
        let from = msg.from;
        gm.handle_incoming(from, msg);
        let event = rx.try_next().unwrap().unwrap();
        assert!(matches!(event, MeshEvent::GossipReceived(_)));
    }

    #[test]
    fn ttl_zero_is_dropped() {
        let (gm, mut rx) = make_gossip(vec![PeerId::random()]);
        let mut msg = GossipMessage::originate(
            GossipSubtype::Chat,
            serde_json::json!("hi"),
            PeerId::random(),
            None,
            10,
            None,
        );
        msg.ttl = 0;
        gm.handle_incoming(msg.from, msg);
        assert!(rx.try_next().is_err());
    }

    #[test]
    fn duplicate_message_id_is_deduplicated() {
        let (gm, mut rx) = make_gossip(vec![]);
        let msg = GossipMessage::originate(
            GossipSubtype::Chat,
            serde_json::json!("hi"),
            PeerId::random(),
            None,
            10,
            None,
        );
        gm.handle_incoming(msg.from, msg.clone());
        let _ = rx.try_next();
        gm.handle_incoming(msg.from, msg);
        assert!(rx.try_next().is_err());
    }

    fn id_with_first_byte(b: u8) -> PeerId {
        let mut bytes = [0u8; crate::id::PEER_ID_LEN];
        bytes[0] = b;
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn directed_message_forwards_only_to_closest_neighbor_excluding_sender() {
        // Line topology A-B-C-D-E; this node is B, forwarding a message
        // from A addressed to E. B's only other open channel is C, which
        // must be closer to E than B itself.
        let a = id_with_first_byte(0x01);
        let b = id_with_first_byte(0x02);
        let c = id_with_first_byte(0x03);
        let e = id_with_first_byte(0x05);
        let (tx, _rx) = mpsc::unbounded();
        let registry = Rc::new(FakeRegistry { peers: vec![a, c], sent: StdRefCell::new(Vec::new()) });
        let gm = GossipManager::new(
            b,
            GossipConfig::default(),
            Rc::new(TestClock::new()),
            Rc::new(ImmediateSpawner),
            Rc::clone(&registry),
            tx,
        );
        let msg = GossipMessage::originate(
            GossipSubtype::Dm,
            serde_json::json!("hi"),
            a,
            Some(e),
            10,
            None,
        );
        gm.handle_incoming(a, msg);
        let sent = registry.sent.borrow();
        assert_eq!(sent.len(), 1, "forwards to exactly one neighbor");
        assert_eq!(sent[0].0, c, "forwards to C, the closer neighbor, never back to A");
    }

    struct PassThroughCrypto;
    impl GossipCrypto for PassThroughCrypto {
        fn decrypt(&self, _from: PeerId, content: &serde_json::Value) -> Option<serde_json::Value> {
            Some(content.clone())
        }
        fn handle_key_exchange(&self, _from: PeerId, _is_response: bool, _content: serde_json::Value) {}
    }

    #[test]
    fn encrypted_message_addressed_to_self_is_delivered_and_never_relayed() {
        let (tx, mut rx) = mpsc::unbounded();
        let registry = Rc::new(FakeRegistry {
            peers: vec![PeerId::random(), PeerId::random()],
            sent: StdRefCell::new(Vec::new()),
        });
        let gm = GossipManager::new(
            PeerId::random(),
            GossipConfig::default(),
            Rc::new(TestClock::new()),
            Rc::new(ImmediateSpawner),
            Rc::clone(&registry),
            tx,
        );
        gm.bind_crypto(Rc::new(PassThroughCrypto));
        let from = PeerId::random();
        let msg = GossipMessage::originate(
            GossipSubtype::Encrypted,
            serde_json::json!("ciphertext"),
            from,
            Some(gm.self_id),
            10,
            None,
        );
        gm.handle_incoming(from, msg);
        assert!(matches!(rx.try_next().unwrap().unwrap(), MeshEvent::GossipReceived(_)));
        assert!(registry.sent.borrow().is_empty(), "encrypted DM to self must not be re-flooded");
    }

    #[test]
    fn directed_message_addressed_to_self_is_delivered_and_never_relayed() {
        let target_peers = vec![PeerId::random(), PeerId::random()];
        let (gm, mut rx) = make_gossip(target_peers);
        let from = PeerId::random();
        let msg = GossipMessage::originate(
            GossipSubtype::Dm,
            serde_json::json!("for you"),
            from,
            Some(gm.self_id),
            10,
            None,
        );
        gm.handle_incoming(from, msg);
        assert!(matches!(rx.try_next().unwrap().unwrap(), MeshEvent::GossipReceived(_)));
    }

    #[test]
    fn broadcast_refused_is_never_recorded_in_history() {
        let (gm, _rx) = make_gossip(vec![]);
        assert!(gm.broadcast(serde_json::json!(""), GossipSubtype::Chat).is_err());
        assert!(gm.history.borrow().is_empty());
    }
}
