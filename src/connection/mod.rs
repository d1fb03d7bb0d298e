//! ConnectionManager: owns the set of `PeerLink`s; admission, retries,
//! timeouts, eviction, renegotiation serialization, incoming-message
//! routing. A single-owner `Rc<RefCell<Inner>>`, with async methods on
//! `Rc<Self>` and one background task pumping events into state
//! mutation.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    rc::{Rc, Weak},
    time::Duration,
};

use futures::{channel::mpsc, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, Instant, Spawner},
    config::ConnectionConfig,
    discovery::DiscoverySource,
    dht::message::DhtMessage,
    error::TransportError,
    events::{Level, MeshEvent},
    frame::MeshFrame,
    gossip::message::GossipMessage,
    id::PeerId,
    peer::{HandshakeState, LocalMedia, PeerEvent, PeerLink},
    signaling::{
        protocol::{ConnectionRejected, SignalingEnvelope, SignalingMessage},
        SignalingSender,
    },
    transport::{IceCandidate, IceConfig, Sdp, Transport},
};

/// Capability a peer implements to receive demultiplexed gossip/DHT
/// frames — each subcomponent receives only the capability interfaces it
/// needs, never a back-reference to the whole mesh.
pub trait FrameRouter {
    fn route_gossip(&self, from: PeerId, message: GossipMessage);
    fn route_dht(&self, from: PeerId, message: DhtMessage);
}

/// Scheduled asynchronously on `DataChannelOpen` so a slow key exchange
/// never blocks the open event.
pub trait KeyExchangeScheduler {
    fn schedule_key_exchange(&self, peer: PeerId);
}

/// What triggered a queued renegotiation.
#[derive(Clone, Debug)]
pub enum RenegotiationTrigger {
    MediaChange(LocalMedia),
    IceRestart,
}

struct PeerRecord {
    link: PeerLink,
}

pub struct ConnectionManager {
    self_weak: RefCell<Weak<ConnectionManager>>,
    self_id: PeerId,
    config: ConnectionConfig,
    transport: Rc<dyn Transport>,
    ice_config: IceConfig,
    clock: Rc<dyn Clock>,
    spawner: Rc<dyn Spawner>,
    signaling: Rc<dyn SignalingSender>,
    frame_router: RefCell<Option<Rc<dyn FrameRouter>>>,
    key_exchange: RefCell<Option<Rc<dyn KeyExchangeScheduler>>>,
    discovery: RefCell<Option<Rc<dyn DiscoverySource>>>,
    peers: RefCell<HashMap<PeerId, PeerRecord>>,
    connection_attempts: RefCell<HashMap<PeerId, u32>>,
    last_attempt_at: RefCell<HashMap<PeerId, Instant>>,
    pending_ice_by_peer: RefCell<HashMap<PeerId, VecDeque<IceCandidate>>>,
    disconnecting: RefCell<HashSet<PeerId>>,
    active_renegotiation: Cell<Option<PeerId>>,
    renegotiation_queue: RefCell<VecDeque<(PeerId, RenegotiationTrigger)>>,
    last_local_media: RefCell<Option<LocalMedia>>,
    has_keys_for: RefCell<HashSet<PeerId>>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: PeerId,
        config: ConnectionConfig,
        transport: Rc<dyn Transport>,
        ice_config: IceConfig,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
        signaling: Rc<dyn SignalingSender>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            self_weak: RefCell::new(Weak::new()),
            self_id,
            config,
            transport,
            ice_config,
            clock,
            spawner,
            signaling,
            frame_router: RefCell::new(None),
            key_exchange: RefCell::new(None),
            discovery: RefCell::new(None),
            peers: RefCell::new(HashMap::new()),
            connection_attempts: RefCell::new(HashMap::new()),
            last_attempt_at: RefCell::new(HashMap::new()),
            pending_ice_by_peer: RefCell::new(HashMap::new()),
            disconnecting: RefCell::new(HashSet::new()),
            active_renegotiation: Cell::new(None),
            renegotiation_queue: RefCell::new(VecDeque::new()),
            last_local_media: RefCell::new(None),
            has_keys_for: RefCell::new(HashSet::new()),
            events_tx,
        });
        *this.self_weak.borrow_mut() = Rc::downgrade(&this);
        this.clone().spawn_periodic_tasks();
        this
    }

    /// Recovers the owning `Rc` from a `&self` call, for trait-object
    /// entry points (`ConnectionRequester`) that only hand back a plain
    /// reference. Always succeeds: the only `Rc<ConnectionManager>` is
    /// the one `new()` creates, and this type is never dropped before
    /// `Mesh::dispose` releases that `Rc`.
    fn rc(&self) -> Rc<Self> {
        self.self_weak
            .borrow()
            .upgrade()
            .expect("ConnectionManager outlived its own Rc")
    }

    pub fn bind_discovery(&self, discovery: Rc<dyn DiscoverySource>) {
        *self.discovery.borrow_mut() = Some(discovery);
    }

    pub fn bind_frame_router(&self, router: Rc<dyn FrameRouter>) {
        *self.frame_router.borrow_mut() = Some(router);
    }

    pub fn bind_key_exchange(&self, scheduler: Rc<dyn KeyExchangeScheduler>) {
        *self.key_exchange.borrow_mut() = Some(scheduler);
    }

    pub fn dispose(&self) {
        *self.discovery.borrow_mut() = None;
        *self.frame_router.borrow_mut() = None;
        *self.key_exchange.borrow_mut() = None;
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    fn status(&self, level: Level, message: impl Into<String>) {
        self.emit(MeshEvent::Status { level, message: message.into() });
    }

    fn discovery(&self) -> Option<Rc<dyn DiscoverySource>> {
        self.discovery.borrow().clone()
    }

    // ---- counts / capacity ----

    pub fn connected_count(&self) -> usize {
        self.peers
            .borrow()
            .values()
            .filter(|p| p.link.state() == HandshakeState::ChannelOpen)
            .count()
    }

    pub fn total_peers(&self) -> usize {
        self.peers.borrow().len()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers
            .borrow()
            .get(&peer)
            .is_some_and(|p| p.link.state() == HandshakeState::ChannelOpen)
    }

    pub fn is_attempting(&self, peer: PeerId) -> bool {
        self.peers.borrow().contains_key(&peer)
    }

    pub fn is_isolated(&self) -> bool {
        self.discovery().is_some_and(|d| self.connected_count() == 0 && d.is_isolated())
    }

    /// Strict admission rule: `connected_count < max_peers && total_peers
    /// < max_peers`.
    pub fn can_accept_more_peers(&self) -> bool {
        self.connected_count() < self.config.max_peers
            && self.total_peers() < self.config.max_peers
    }

    // ---- outbound connect ----

    /// `connect_to_peer(target)` is single-argument; recovery media comes
    /// from `last_local_media`, never a call-site parameter.
    pub async fn connect_to_peer(self: &Rc<Self>, target: PeerId) {
        if self.config.max_peers == 0 {
            return;
        }
        if self.peers.borrow().contains_key(&target) {
            return;
        }
        if let Some(last) = self.last_attempt_at.borrow().get(&target) {
            let isolated = self.is_isolated();
            if self.clock.now().since(*last) < self.config.retry_delay(isolated) {
                return;
            }
        }
        if !self.can_accept_more_peers() {
            self.sweep_stale_peers();
            if !self.can_accept_more_peers() {
                return;
            }
        }

        let is_initiator = self.self_id > target;
        self.last_attempt_at.borrow_mut().insert(target, self.clock.now());
        self.create_link(target, is_initiator);

        if is_initiator {
            if let Some(record) = self.peers.borrow().get(&target) {
                let link = record.link.clone();
                match link.create_offer().await {
                    Ok(sdp) => {
                        self.signaling.send(SignalingEnvelope::new(
                            self.self_id,
                            Some(target),
                            SignalingMessage::Offer { data: sdp },
                        ));
                    }
                    Err(e) => {
                        warn!(peer = %target, error = %e, "create_offer failed");
                    }
                }
            }
        }
        self.spawn_attempt_timeout(target);
    }

    fn create_link(self: &Rc<Self>, target: PeerId, is_initiator: bool) -> PeerLink {
        let (link, mut events) = PeerLink::create(
            target,
            is_initiator,
            self.transport.as_ref(),
            self.ice_config.clone(),
            Rc::clone(&self.clock),
            Rc::clone(&self.spawner),
        );
        if let Some(media) = self.last_local_media.borrow().clone() {
            link.set_local_stream(Some(media));
        }
        self.peers.borrow_mut().insert(target, PeerRecord { link: link.clone() });

        if let Some(queued) = self.pending_ice_by_peer.borrow_mut().remove(&target) {
            let link2 = link.clone();
            self.spawner.spawn(Box::pin(async move {
                for c in queued {
                    link2.handle_ice(c).await;
                }
            }));
        }

        let this = Rc::clone(self);
        self.spawner.spawn(Box::pin(async move {
            while let Some(ev) = events.next().await {
                this.handle_peer_event(target, ev).await;
            }
        }));
        link
    }

    async fn handle_peer_event(self: &Rc<Self>, peer: PeerId, ev: PeerEvent) {
        match ev {
            PeerEvent::IceCandidate(c) => {
                self.signaling.send(SignalingEnvelope::new(
                    self.self_id,
                    Some(peer),
                    SignalingMessage::IceCandidate { data: c },
                ));
            }
            PeerEvent::Connected => {
                self.emit(MeshEvent::PeerConnected(peer));
            }
            PeerEvent::DataChannelOpen => {
                self.connection_attempts.borrow_mut().remove(&peer);
                self.last_attempt_at.borrow_mut().remove(&peer);
                if let Some(d) = self.discovery() {
                    d.record_connected();
                }
                if !self.has_keys_for.borrow().contains(&peer) {
                    if let Some(ke) = self.key_exchange.borrow().clone() {
                        ke.schedule_key_exchange(peer);
                    }
                }
                self.status(Level::Info, format!("{} connected", peer.short()));
            }
            PeerEvent::Message(bytes) => {
                self.dispatch_frame(peer, &bytes);
            }
            PeerEvent::RemoteStream(_) => {}
            PeerEvent::RenegotiationNeeded => {
                self.trigger_renegotiation(peer, RenegotiationTrigger::MediaChange(
                    self.last_local_media.borrow().clone().unwrap_or_default(),
                ))
                .await;
            }
            PeerEvent::Disconnected(reason) => {
                self.teardown_peer(peer, reason).await;
            }
            PeerEvent::Failed(reason) => {
                self.teardown_peer(peer, reason).await;
            }
        }
    }

    async fn teardown_peer(self: &Rc<Self>, peer: PeerId, reason: String) {
        if !self.disconnecting.borrow_mut().insert(peer) {
            return;
        }
        self.peers.borrow_mut().remove(&peer);
        self.has_keys_for.borrow_mut().remove(&peer);
        if self.active_renegotiation.get() == Some(peer) {
            self.active_renegotiation.set(None);
            self.drain_renegotiation_queue().await;
        }
        self.emit(MeshEvent::PeerDisconnected(peer, reason.clone()));
        self.status(Level::Warning, format!("{} disconnected: {reason}", peer.short()));
        self.disconnecting.borrow_mut().remove(&peer);
    }

    // ---- admission for incoming offers ----

    /// Inbound `offer` handling, folding in the admission and
    /// simultaneous-initiation race rules.
    pub async fn handle_offer(self: &Rc<Self>, from: PeerId, sdp: Sdp) {
        if let Some(record) = self.peers.borrow().get(&from).map(|r| r.link.clone()) {
            if record.is_initiator() && record.state() == HandshakeState::Offered {
                if self.self_id > from {
                    // We should initiate and did; we're stuck. Accept theirs.
                    record.close();
                    self.peers.borrow_mut().remove(&from);
                } else {
                    // We shouldn't have initiated; back down.
                    record.close();
                    self.peers.borrow_mut().remove(&from);
                }
            } else {
                debug!(peer = %from, "ignoring duplicate offer");
                return;
            }
        }

        if !self.can_accept_more_peers() {
            if self.config.eviction_enabled {
                if let Some(victim) = self.pick_eviction_victim(from) {
                    self.disconnect_peer(victim, "evicted for incoming peer".to_string()).await;
                } else {
                    self.sweep_stale_peers();
                }
            } else {
                self.sweep_stale_peers();
            }
            if !self.can_accept_more_peers() {
                self.signaling.send(SignalingEnvelope::new(
                    self.self_id,
                    Some(from),
                    SignalingMessage::ConnectionRejected {
                        data: ConnectionRejected {
                            reason: "max_peers_reached".to_string(),
                            details: None,
                            current_count: self.connected_count(),
                            max_peers: self.config.max_peers,
                        },
                    },
                ));
                return;
            }
        }

        let link = self.create_link(from, false);
        match link.handle_offer(sdp).await {
            Ok(answer) => {
                self.signaling.send(SignalingEnvelope::new(
                    self.self_id,
                    Some(from),
                    SignalingMessage::Answer { data: answer },
                ));
                self.spawn_attempt_timeout(from);
            }
            Err(e) => warn!(peer = %from, error = %e, "handle_offer failed"),
        }
    }

    /// Evicts a victim with greater XOR distance from self than the
    /// incoming peer.
    fn pick_eviction_victim(&self, incoming: PeerId) -> Option<PeerId> {
        let incoming_distance = self.self_id.xor_distance(&incoming);
        self.peers
            .borrow()
            .keys()
            .copied()
            .filter(|p| {
                crate::id::closer(&self.self_id.xor_distance(p), &incoming_distance)
                    == std::cmp::Ordering::Greater
            })
            .max_by(|a, b| {
                crate::id::closer(&self.self_id.xor_distance(a), &self.self_id.xor_distance(b))
            })
    }

    pub async fn handle_answer(self: &Rc<Self>, from: PeerId, sdp: Sdp) {
        let Some(link) = self.peers.borrow().get(&from).map(|r| r.link.clone()) else {
            return;
        };
        if let Err(e) = link.handle_answer(sdp).await {
            warn!(peer = %from, error = %e, "handle_answer failed");
        }
    }

    pub async fn handle_ice(&self, from: PeerId, candidate: IceCandidate) {
        if let Some(link) = self.peers.borrow().get(&from).map(|r| r.link.clone()) {
            link.handle_ice(candidate).await;
        } else {
            self.pending_ice_by_peer.borrow_mut().entry(from).or_default().push_back(candidate);
        }
    }

    pub async fn handle_connection_rejected(&self, from: PeerId) {
        if !self.is_connected(from) {
            if let Some(record) = self.peers.borrow_mut().remove(&from) {
                record.link.close();
            }
        }
    }

    pub async fn disconnect_peer(&self, peer: PeerId, reason: String) {
        if let Some(record) = self.peers.borrow_mut().remove(&peer) {
            record.link.close();
            self.has_keys_for.borrow_mut().remove(&peer);
            self.emit(MeshEvent::PeerDisconnected(peer, reason));
        }
    }

    pub fn disconnect_all(&self) {
        for (_, record) in self.peers.borrow_mut().drain() {
            record.link.close();
        }
    }

    pub fn remove_peer(&self, peer: PeerId) {
        self.peers.borrow_mut().remove(&peer);
    }

    // ---- renegotiation serialization ----

    async fn trigger_renegotiation(self: &Rc<Self>, peer: PeerId, trigger: RenegotiationTrigger) {
        if self.active_renegotiation.get().is_some() {
            self.renegotiation_queue.borrow_mut().push_back((peer, trigger));
            return;
        }
        self.start_renegotiation(peer, trigger).await;
    }

    async fn start_renegotiation(self: &Rc<Self>, peer: PeerId, trigger: RenegotiationTrigger) {
        let Some(link) = self.peers.borrow().get(&peer).map(|r| r.link.clone()) else {
            self.drain_renegotiation_queue_boxed();
            return;
        };
        self.active_renegotiation.set(Some(peer));

        if let RenegotiationTrigger::MediaChange(media) = &trigger {
            link.set_local_stream(Some(media.clone()));
        }

        match link.create_offer().await {
            Ok(sdp) => {
                self.signaling.send(SignalingEnvelope::new(
                    self.self_id,
                    Some(peer),
                    SignalingMessage::RenegotiationOffer { data: sdp },
                ));
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "renegotiation offer failed");
                self.active_renegotiation.set(None);
                self.drain_renegotiation_queue().await;
            }
        }
    }

    fn drain_renegotiation_queue_boxed(self: &Rc<Self>) {
        let this = Rc::clone(self);
        self.spawner.spawn(Box::pin(async move {
            this.drain_renegotiation_queue().await;
        }));
    }

    async fn drain_renegotiation_queue(self: &Rc<Self>) {
        if self.active_renegotiation.get().is_some() {
            return;
        }
        let next = self.renegotiation_queue.borrow_mut().pop_front();
        if let Some((peer, trigger)) = next {
            self.start_renegotiation(peer, trigger).await;
        }
    }

    pub async fn handle_renegotiation_offer(self: &Rc<Self>, from: PeerId, sdp: Sdp) {
        let Some(link) = self.peers.borrow().get(&from).map(|r| r.link.clone()) else {
            return;
        };
        match link.handle_offer(sdp).await {
            Ok(answer) => {
                self.signaling.send(SignalingEnvelope::new(
                    self.self_id,
                    Some(from),
                    SignalingMessage::RenegotiationAnswer { data: answer },
                ));
            }
            Err(e) => warn!(peer = %from, error = %e, "renegotiation answer failed"),
        }
    }

    pub async fn handle_renegotiation_answer(self: &Rc<Self>, from: PeerId, sdp: Sdp) {
        let Some(link) = self.peers.borrow().get(&from).map(|r| r.link.clone()) else {
            return;
        };
        if let Err(e) = link.handle_answer(sdp).await {
            warn!(peer = %from, error = %e, "renegotiation handle_answer failed");
        }
        if self.active_renegotiation.get() == Some(from) {
            self.active_renegotiation.set(None);
            self.drain_renegotiation_queue().await;
        }
    }

    /// Queues a local-media change for `peer`, serialized behind any
    /// renegotiation already in flight.
    pub async fn set_local_stream(self: &Rc<Self>, media: Option<LocalMedia>) {
        *self.last_local_media.borrow_mut() = media.clone();
        let peers: Vec<PeerId> = self.peers.borrow().keys().copied().collect();
        for peer in peers {
            self.trigger_renegotiation(
                peer,
                RenegotiationTrigger::MediaChange(media.clone().unwrap_or_default()),
            )
            .await;
        }
    }

    // ---- incoming data-channel frames ----

    fn dispatch_frame(self: &Rc<Self>, from: PeerId, bytes: &[u8]) {
        let frame: MeshFrame = match serde_json::from_slice(bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!(peer = %from, error = %e, "dropped malformed mesh frame");
                return;
            }
        };
        match frame {
            MeshFrame::Gossip { message } => {
                if let Some(router) = self.frame_router.borrow().clone() {
                    router.route_gossip(from, message);
                }
            }
            MeshFrame::Dht { message } => {
                if let Some(router) = self.frame_router.borrow().clone() {
                    router.route_dht(from, message);
                }
            }
            MeshFrame::RenegotiationOffer { data } => {
                let this = Rc::clone(self);
                self.spawner.spawn(Box::pin(async move {
                    this.handle_renegotiation_offer(from, data).await;
                }));
            }
            MeshFrame::RenegotiationAnswer { data } => {
                let this = Rc::clone(self);
                self.spawner.spawn(Box::pin(async move {
                    this.handle_renegotiation_answer(from, data).await;
                }));
            }
            MeshFrame::Binary { data, .. } => {
                self.emit(MeshEvent::Binary(from, data));
            }
            other if other.is_filtered() => {
                debug!(peer = %from, "filtered mesh frame processed internally");
            }
            _ => {}
        }
    }

    /// Sends a frame to a connected peer's data channel. Used by
    /// `Gossip`/`Dht` to transmit over an already-open link.
    pub fn send_frame(&self, peer: PeerId, frame: &MeshFrame) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        let link = self.peers.borrow().get(&peer).map(|r| r.link.clone());
        match link {
            Some(link) => link.send(&bytes),
            None => Err(TransportError::ChannelNotOpen),
        }
    }

    /// Snapshot of peers with an open data channel, for Gossip/DHT
    /// propagation. Readers MUST snapshot rather than iterate live state,
    /// since sending can trigger re-entrant mutation of `peers`.
    pub fn open_channel_peers(&self) -> Vec<PeerId> {
        self.peers
            .borrow()
            .iter()
            .filter(|(_, r)| r.link.state() == HandshakeState::ChannelOpen)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn note_keys_received(&self, peer: PeerId) {
        self.has_keys_for.borrow_mut().insert(peer);
    }

    // ---- periodic tasks ----

    fn spawn_periodic_tasks(self: Rc<Self>) {
        let stale = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            self.config.stale_sweep_interval,
            Box::new(move || stale.sweep_stale_peers()),
        );

        let stuck = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            self.config.stuck_link_monitor_interval,
            Box::new(move || stuck.clone().check_stuck_links()),
        );

        let isolation = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            self.config.isolation_monitor_interval,
            Box::new(move || isolation.clone().check_isolation()),
        );
    }

    /// Every 30s, removes peers `Disconnected` for >5s or in
    /// `{Connecting, Failed, Closed}` for >60s. In this design
    /// terminal links are removed from `peers` immediately on
    /// `Disconnected`/`Failed`, so the sweep's real job is links that
    /// never progressed past `New`/`Offered`/`Answered` within the
    /// transient-state grace period.
    fn sweep_stale_peers(&self) {
        let now = self.clock.now();
        let grace = self.config.transient_state_grace;
        let stale: Vec<PeerId> = self
            .peers
            .borrow()
            .iter()
            .filter(|(_, r)| {
                !r.link.state().is_negotiated() && now.since(r.link.created_at()) > grace
            })
            .map(|(id, _)| *id)
            .collect();
        for peer in stale {
            if let Some(record) = self.peers.borrow_mut().remove(&peer) {
                record.link.close();
            }
        }
    }

    /// Any link stuck in `Offered` (have-local-offer) longer than
    /// `stuck_link_age` is force-recovered.
    fn check_stuck_links(self: Rc<Self>) {
        let age = self.config.stuck_link_age;
        let stuck: Vec<PeerId> = self
            .peers
            .borrow()
            .iter()
            .filter(|(_, r)| {
                r.link.state() == HandshakeState::Offered
                    && r.link.offer_age().is_some_and(|a| a > age)
            })
            .map(|(id, _)| *id)
            .collect();
        for peer in stuck {
            let this = Rc::clone(&self);
            self.spawner.spawn(Box::pin(async move {
                this.force_recovery(peer).await;
            }));
        }
    }

    /// Closes the wedged link, constructs a fresh one preserving the last
    /// configured local media, and restarts the offer flow.
    async fn force_recovery(self: &Rc<Self>, peer: PeerId) {
        if let Some(record) = self.peers.borrow_mut().remove(&peer) {
            record.link.close();
        }
        self.status(Level::Warning, format!("recovering wedged link to {}", peer.short()));
        let link = self.create_link(peer, true);
        if let Ok(sdp) = link.create_offer().await {
            self.signaling.send(SignalingEnvelope::new(
                self.self_id,
                Some(peer),
                SignalingMessage::Offer { data: sdp },
            ));
        }
        self.spawn_attempt_timeout(peer);
    }

    /// If connected count is 0 but discovered peers exist, clears
    /// attempt/cooldown state and attempts the three closest peers with a
    /// 1s stagger.
    fn check_isolation(self: Rc<Self>) {
        let Some(discovery) = self.discovery() else { return };
        if self.connected_count() != 0 || !discovery.is_isolated() {
            return;
        }
        self.connection_attempts.borrow_mut().clear();
        self.last_attempt_at.borrow_mut().clear();
        let targets = discovery.closest_unconnected(3);
        for (i, target) in targets.into_iter().enumerate() {
            let this = Rc::clone(&self);
            let spawner = Rc::clone(&self.spawner);
            self.spawner.spawn(Box::pin(async move {
                spawner.delay(Duration::from_secs(i as u64)).await;
                this.connect_to_peer(target).await;
            }));
        }
    }

    fn spawn_attempt_timeout(self: &Rc<Self>, peer: PeerId) {
        let has_media = self.last_local_media.borrow().is_some();
        let isolated = self.is_isolated();
        let timeout = self.config.connection_timeout(has_media, isolated);
        let this = Rc::clone(self);
        let spawner = Rc::clone(&self.spawner);
        self.spawner.spawn(Box::pin(async move {
            spawner.delay(timeout).await;
            this.on_attempt_timeout(peer).await;
        }));
    }

    /// On timeout, increments attempts; if `attempts >= max_attempts`,
    /// removes the peer from discovery; else clears the attempt for retry
    /// later.
    async fn on_attempt_timeout(self: &Rc<Self>, peer: PeerId) {
        let still_pending = self
            .peers
            .borrow()
            .get(&peer)
            .is_some_and(|r| r.link.state() != HandshakeState::ChannelOpen);
        if !still_pending {
            return;
        }

        if let Some(record) = self.peers.borrow_mut().remove(&peer) {
            record.link.close();
        }

        let isolated = self.is_isolated();
        let max_attempts = self.config.max_attempts(isolated);
        let attempts = {
            let mut attempts = self.connection_attempts.borrow_mut();
            let counter = attempts.entry(peer).or_insert(0);
            *counter += 1;
            *counter
        };

        if attempts >= max_attempts {
            info!(peer = %peer, attempts, "max attempts reached, giving up");
            self.connection_attempts.borrow_mut().remove(&peer);
            if let Some(d) = self.discovery() {
                d.record_attempt_failed();
            }
        } else {
            self.last_attempt_at.borrow_mut().remove(&peer);
        }
    }
}

impl crate::discovery::ConnectionRequester for ConnectionManager {
    fn request_connection(&self, target: PeerId) {
        let this = self.rc();
        self.spawner.spawn(Box::pin(async move {
            this.connect_to_peer(target).await;
        }));
    }

    fn is_attempting(&self, target: PeerId) -> bool {
        ConnectionManager::is_attempting(self, target)
    }

    fn is_connected(&self, target: PeerId) -> bool {
        ConnectionManager::is_connected(self, target)
    }

    fn connected_count(&self) -> usize {
        ConnectionManager::connected_count(self)
    }

    fn can_accept_more_peers(&self) -> bool {
        ConnectionManager::can_accept_more_peers(self)
    }
}

impl crate::gossip::PeerRegistry for ConnectionManager {
    fn open_channel_peers(&self) -> Vec<PeerId> {
        ConnectionManager::open_channel_peers(self)
    }

    fn send_frame(&self, peer: PeerId, frame: &MeshFrame) {
        if let Err(err) = ConnectionManager::send_frame(self, peer, frame) {
            debug!(peer = %peer, %err, "dropping gossip frame, channel unavailable");
        }
    }
}

impl crate::dht::PeerRegistry for ConnectionManager {
    fn open_channel_peers(&self) -> Vec<PeerId> {
        ConnectionManager::open_channel_peers(self)
    }

    fn send_frame(&self, peer: PeerId, frame: &MeshFrame) {
        if let Err(err) = ConnectionManager::send_frame(self, peer, frame) {
            debug!(peer = %peer, %err, "dropping dht frame, channel unavailable");
        }
    }
}

impl crate::crypto::KeyHolderNotify for ConnectionManager {
    fn note_keys_received(&self, peer: PeerId) {
        ConnectionManager::note_keys_received(self, peer);
    }
}
