//! PeerDiscovery: known-but-unconnected peer table, XOR-distance
//! ordering, deterministic initiator election, optimization scheduling.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use futures::channel::mpsc;
use rand::Rng;
use tracing::debug;

use crate::{
    clock::{Clock, Instant, Spawner},
    config::DiscoveryConfig,
    events::MeshEvent,
    id::PeerId,
};

/// Narrow interface [`PeerDiscovery`] needs from the connection layer,
/// breaking the natural cycle (discovery triggers connects; the
/// connection manager's isolation monitor reads discovery) into a
/// leaf-first dependency.
pub trait ConnectionRequester {
    fn request_connection(&self, target: PeerId);
    fn is_attempting(&self, target: PeerId) -> bool;
    fn is_connected(&self, target: PeerId) -> bool;
    fn connected_count(&self) -> usize;
    fn can_accept_more_peers(&self) -> bool;
}

/// Narrow interface the connection layer needs from [`PeerDiscovery`]
/// (isolation monitor, attempt bookkeeping) — the other half of the
/// leaf-first split described on [`ConnectionRequester`].
pub trait DiscoverySource {
    fn is_isolated(&self) -> bool;
    fn closest_unconnected(&self, n: usize) -> Vec<PeerId>;
    fn record_attempt_failed(&self);
    fn record_connected(&self);
}

struct Entry {
    last_seen: Instant,
}

pub struct PeerDiscovery {
    self_id: PeerId,
    config: DiscoveryConfig,
    clock: Rc<dyn Clock>,
    spawner: Rc<dyn Spawner>,
    discovered: RefCell<HashMap<PeerId, Entry>>,
    connections: RefCell<Option<Rc<dyn ConnectionRequester>>>,
    failed_attempts: Cell<u32>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl PeerDiscovery {
    pub fn new(
        self_id: PeerId,
        config: DiscoveryConfig,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            self_id,
            config,
            clock,
            spawner,
            discovered: RefCell::new(HashMap::new()),
            connections: RefCell::new(None),
            failed_attempts: Cell::new(0),
            events_tx,
        });
        this.clone().spawn_stale_sweep();
        this
    }

    /// Breaks the `PeerDiscovery` ↔ `ConnectionManager` construction
    /// cycle: bound once both halves exist.
    pub fn bind_connections(&self, connections: Rc<dyn ConnectionRequester>) {
        *self.connections.borrow_mut() = Some(connections);
    }

    /// Drops the back-reference to `ConnectionManager`, an explicit
    /// manual-disposal step rather than relying on `Drop` to break the
    /// `Rc` cycle.
    pub fn dispose(&self) {
        *self.connections.borrow_mut() = None;
    }

    fn spawn_stale_sweep(self: Rc<Self>) {
        let interval = self.config.stale_sweep_interval;
        let this = Rc::clone(&self);
        self.spawner.clone().spawn_interval(
            interval,
            Box::new(move || this.sweep_stale()),
        );
    }

    fn conn(&self) -> Option<Rc<dyn ConnectionRequester>> {
        self.connections.borrow().clone()
    }

    /// `add(peer_id)`.
    pub fn add(&self, peer_id: PeerId) {
        if peer_id == self.self_id {
            return;
        }
        let now = self.clock.now();
        let is_new = {
            let mut discovered = self.discovered.borrow_mut();
            match discovered.get_mut(&peer_id) {
                Some(entry) => {
                    entry.last_seen = now;
                    false
                }
                None => {
                    discovered.insert(peer_id, Entry { last_seen: now });
                    true
                }
            }
        };
        if is_new {
            let _ = self.events_tx.unbounded_send(MeshEvent::PeerDiscovered(peer_id));
        }
        if !self.config.auto_discovery {
            return;
        }
        if let Some(conn) = self.conn() {
            if self.should_initiate(peer_id)
                && !conn.is_attempting(peer_id)
                && !conn.is_connected(peer_id)
                && conn.can_accept_more_peers()
            {
                conn.request_connection(peer_id);
            }
        }
    }

    pub fn remove(&self, peer_id: PeerId) {
        self.discovered.borrow_mut().remove(&peer_id);
    }

    pub fn is_discovered(&self, peer_id: PeerId) -> bool {
        self.discovered.borrow().contains_key(&peer_id)
    }

    /// Total election rule plus the three-tier isolation override.
    pub fn should_initiate(&self, target: PeerId) -> bool {
        if !self.is_isolated() {
            return self.self_id > target;
        }
        if self.self_id > target {
            return true;
        }
        if self.closest_unconnected(3).contains(&target) {
            return true;
        }
        self.failed_attempts.get() >= self.config.isolation_failures_before_any
    }

    /// Connected count is 0 but we know of peers.
    pub fn is_isolated(&self) -> bool {
        match self.conn() {
            Some(conn) => conn.connected_count() == 0 && !self.discovered.borrow().is_empty(),
            None => false,
        }
    }

    /// Called by `ConnectionManager` when an attempt we initiated (on
    /// discovery's own request) exhausts its retries.
    pub fn record_attempt_failed(&self) {
        self.failed_attempts.set(self.failed_attempts.get() + 1);
    }

    pub fn record_connected(&self) {
        self.failed_attempts.set(0);
    }

    /// The `n` closest unconnected, not-attempting discovered peers by
    /// XOR distance.
    pub fn closest_unconnected(&self, n: usize) -> Vec<PeerId> {
        let conn = self.conn();
        let mut candidates: Vec<PeerId> = self
            .discovered
            .borrow()
            .keys()
            .copied()
            .filter(|id| match &conn {
                Some(conn) => !conn.is_connected(*id) && !conn.is_attempting(*id),
                None => true,
            })
            .collect();
        candidates.sort_by(|a, b| {
            crate::id::closer(&self.self_id.xor_distance(a), &self.self_id.xor_distance(b))
        });
        candidates.truncate(n);
        candidates
    }

    /// Schedules a mesh-optimization pass after a random 10-15s jitter.
    /// Call whenever the topology changes.
    pub fn schedule_optimize(self: &Rc<Self>) {
        let jitter = {
            let (min, max) =
                (self.config.optimization_jitter_min, self.config.optimization_jitter_max);
            let min_ms = min.as_millis() as u64;
            let max_ms = max.as_millis().max(min.as_millis() as u128 + 1) as u64;
            std::time::Duration::from_millis(rand::thread_rng().gen_range(min_ms..max_ms))
        };
        let this = Rc::clone(self);
        let spawner = Rc::clone(&self.spawner);
        self.spawner.spawn(Box::pin(async move {
            spawner.delay(jitter).await;
            this.optimize();
        }));
    }

    /// Attempts every not-yet-attempting, unconnected discovered peer we
    /// should initiate toward, capacity permitting.
    pub fn optimize(&self) {
        let Some(conn) = self.conn() else { return };
        let targets = self.closest_unconnected(usize::MAX);
        for target in targets {
            if !conn.can_accept_more_peers() {
                break;
            }
            if self.should_initiate(target) {
                conn.request_connection(target);
            }
        }
    }

    /// Used by `SignalingHandler` on `connection-rejected` while isolated:
    /// try the next closest discovered peer, excluding the one that just
    /// rejected us.
    pub fn try_next_closest(&self, excluding: PeerId) {
        let Some(conn) = self.conn() else { return };
        for target in self.closest_unconnected(usize::MAX) {
            if target == excluding {
                continue;
            }
            if conn.can_accept_more_peers() {
                conn.request_connection(target);
            }
            break;
        }
    }

    fn sweep_stale(&self) {
        let now = self.clock.now();
        let threshold = self.config.stale_after;
        let mut discovered = self.discovered.borrow_mut();
        let before = discovered.len();
        discovered.retain(|_, entry| now.since(entry.last_seen) < threshold);
        let removed = before - discovered.len();
        if removed > 0 {
            debug!(removed, "swept stale discovery entries");
        }
    }
}

impl DiscoverySource for PeerDiscovery {
    fn is_isolated(&self) -> bool {
        PeerDiscovery::is_isolated(self)
    }

    fn closest_unconnected(&self, n: usize) -> Vec<PeerId> {
        PeerDiscovery::closest_unconnected(self, n)
    }

    fn record_attempt_failed(&self) {
        PeerDiscovery::record_attempt_failed(self)
    }

    fn record_connected(&self) {
        PeerDiscovery::record_connected(self)
    }
}

impl crate::gossip::PeerAnnouncementSink for PeerDiscovery {
    fn on_peer_announcement(&self, peer: PeerId) {
        PeerDiscovery::add(self, peer);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell as StdRefCell;

    use super::*;
    use crate::clock::test_support::TestClock;

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

    #[derive(Default)]
    struct FakeConnections {
        connected: StdRefCell<Vec<PeerId>>,
        attempting: StdRefCell<Vec<PeerId>>,
        requested: StdRefCell<Vec<PeerId>>,
        max_peers: usize,
    }

    impl FakeConnections {
        fn new(max_peers: usize) -> Rc<Self> {
            Rc::new(Self { max_peers, ..Default::default() })
        }
    }

    impl ConnectionRequester for FakeConnections {
        fn request_connection(&self, target: PeerId) {
            self.requested.borrow_mut().push(target);
        }

        fn is_attempting(&self, target: PeerId) -> bool {
            self.attempting.borrow().contains(&target)
        }

        fn is_connected(&self, target: PeerId) -> bool {
            self.connected.borrow().contains(&target)
        }

        fn connected_count(&self) -> usize {
            self.connected.borrow().len()
        }

        fn can_accept_more_peers(&self) -> bool {
            self.connected.borrow().len() < self.max_peers
        }
    }

    fn discovery(self_id: PeerId) -> Rc<PeerDiscovery> {
        let (tx, _rx) = mpsc::unbounded();
        PeerDiscovery::new(
            self_id,
            DiscoveryConfig::default(),
            Rc::new(TestClock::new()),
            Rc::new(ImmediateSpawner),
            tx,
        )
    }

    fn id_with_first_byte(b: u8) -> PeerId {
        let mut bytes = [0u8; crate::id::PEER_ID_LEN];
        bytes[0] = b;
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn add_emits_discovered_only_once_and_ignores_self() {
        let self_id = id_with_first_byte(0x80);
        let (tx, mut rx) = mpsc::unbounded();
        let disc = PeerDiscovery::new(
            self_id,
            DiscoveryConfig::default(),
            Rc::new(TestClock::new()),
            Rc::new(ImmediateSpawner),
            tx,
        );
        disc.add(self_id);
        assert!(rx.try_next().is_err(), "self-announcement must not be recorded");

        let other = id_with_first_byte(0x01);
        disc.add(other);
        assert!(matches!(rx.try_next().unwrap().unwrap(), MeshEvent::PeerDiscovered(p) if p == other));
        disc.add(other);
        assert!(rx.try_next().is_err(), "re-announcing a known peer does not re-fire");
        assert!(disc.is_discovered(other));
    }

    #[test]
    fn should_initiate_is_total_order_without_isolation() {
        let low = id_with_first_byte(0x01);
        let high = id_with_first_byte(0xFF);
        let disc = discovery(low);
        // A non-empty connected set means `is_isolated` is false, so the
        // plain `self_id > target` rule applies with no overrides.
        let conn = FakeConnections::new(6);
        conn.connected.borrow_mut().push(id_with_first_byte(0x02));
        disc.bind_connections(conn);
        assert!(!disc.should_initiate(high), "low id never initiates toward a higher id");
        assert!(disc.should_initiate(id_with_first_byte(0x00)), "low id initiates toward a lower id");
    }

    #[test]
    fn isolation_tier_one_relaxes_to_any_smaller_peer() {
        let self_id = id_with_first_byte(0x80);
        let disc = discovery(self_id);
        let conn = FakeConnections::new(6);
        disc.bind_connections(conn);
        let smaller = id_with_first_byte(0x10);
        disc.add(smaller);
        assert!(disc.is_isolated());
        assert!(disc.should_initiate(smaller), "tier 1: any target < self_id");
    }

    #[test]
    fn isolation_tier_two_picks_three_closest_by_xor() {
        let self_id = id_with_first_byte(0x00);
        let disc = discovery(self_id);
        let conn = FakeConnections::new(6);
        disc.bind_connections(conn);
        // All targets are > self_id, so tier 1 never applies; ordering by
        // XOR distance from 0x00 is just ascending first-byte order here.
        let near = id_with_first_byte(0x01);
        let mid = id_with_first_byte(0x02);
        let third = id_with_first_byte(0x03);
        let far = id_with_first_byte(0xF0);
        for t in [near, mid, third, far] {
            disc.add(t);
        }
        assert!(disc.should_initiate(near));
        assert!(disc.should_initiate(mid));
        assert!(disc.should_initiate(third));
        assert!(!disc.should_initiate(far), "far peer is not among the 3 closest");
    }

    #[test]
    fn isolation_tier_three_unlocks_after_enough_failures() {
        let self_id = id_with_first_byte(0x00);
        let disc = discovery(self_id);
        let conn = FakeConnections::new(6);
        disc.bind_connections(conn);
        // Populate more than 3 "far" unconnected peers so `far` falls
        // outside the tier-2 window regardless of ordering.
        let far = id_with_first_byte(0xF0);
        for b in [0x01, 0x02, 0x03, 0x04] {
            disc.add(id_with_first_byte(b));
        }
        disc.add(far);
        assert!(!disc.should_initiate(far));
        disc.record_attempt_failed();
        assert!(!disc.should_initiate(far), "one failure is not enough");
        disc.record_attempt_failed();
        assert!(disc.should_initiate(far), "two failures unlock tier 3");
    }

    #[test]
    fn closest_unconnected_orders_by_xor_distance_and_excludes_busy_peers() {
        let self_id = id_with_first_byte(0x00);
        let disc = discovery(self_id);
        let conn = FakeConnections::new(6);
        let near = id_with_first_byte(0x01);
        let mid = id_with_first_byte(0x02);
        let connected_peer = id_with_first_byte(0x03);
        let attempting_peer = id_with_first_byte(0x04);
        conn.connected.borrow_mut().push(connected_peer);
        conn.attempting.borrow_mut().push(attempting_peer);
        disc.bind_connections(Rc::clone(&conn));
        for t in [near, mid, connected_peer, attempting_peer] {
            disc.add(t);
        }
        let closest = disc.closest_unconnected(10);
        assert_eq!(closest, vec![near, mid]);
    }

    #[test]
    fn record_connected_resets_failed_attempt_counter() {
        let disc = discovery(id_with_first_byte(0x00));
        disc.record_attempt_failed();
        disc.record_attempt_failed();
        disc.record_connected();
        assert_eq!(disc.failed_attempts.get(), 0);
    }

    #[test]
    fn auto_discovery_requests_a_connection_when_we_should_initiate() {
        let self_id = id_with_first_byte(0xFF);
        let disc = discovery(self_id);
        let conn = FakeConnections::new(6);
        disc.bind_connections(Rc::clone(&conn));
        let target = id_with_first_byte(0x01);
        disc.add(target);
        assert_eq!(*conn.requested.borrow(), vec![target]);
    }

    #[test]
    fn remove_forgets_a_discovered_peer() {
        let disc = discovery(id_with_first_byte(0x00));
        let peer = id_with_first_byte(0x01);
        disc.add(peer);
        assert!(disc.is_discovered(peer));
        disc.remove(peer);
        assert!(!disc.is_discovered(peer));
    }

    #[test]
    fn dispose_drops_the_connections_back_reference() {
        let disc = discovery(id_with_first_byte(0x00));
        disc.bind_connections(FakeConnections::new(6));
        assert!(disc.conn().is_some());
        disc.dispose();
        assert!(disc.conn().is_none());
    }
}
