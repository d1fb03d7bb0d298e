//! Mesh: the top-level facade wiring every subcomponent together and
//! exposing the crate's public surface. One object owning its
//! collaborators behind a narrow public API, with an explicit `dispose`
//! that breaks the `Rc` cycles the collaborators wire up among
//! themselves.

use std::rc::Rc;

use futures::channel::mpsc;

use crate::{
    clock::{Clock, Spawner},
    config::MeshConfig,
    connection::{ConnectionManager, FrameRouter},
    crypto::{CryptoManager, Keypair, KeypairExport},
    dht::{message::DhtMessage, Dht, DhtRecord},
    discovery::PeerDiscovery,
    error::MeshResult,
    events::MeshEvent,
    gossip::{message::GossipMessage, GossipManager, GossipSubtype},
    id::PeerId,
    signaling::{protocol::SignalingEnvelope, SignalingHandler, SignalingSender},
    transport::Transport,
};

/// Demultiplexes `ConnectionManager`'s incoming `MeshFrame::Gossip`/
/// `MeshFrame::Dht` frames to the two subsystems that own them.
struct Router {
    gossip: Rc<GossipManager>,
    dht: Rc<Dht>,
}

impl FrameRouter for Router {
    fn route_gossip(&self, from: PeerId, message: GossipMessage) {
        self.gossip.handle_incoming(from, message);
    }

    fn route_dht(&self, from: PeerId, message: DhtMessage) {
        self.dht.handle_message(from, message);
    }
}

/// Owns one node's full complement of collaborators: connections,
/// discovery, gossip, DHT, crypto.
pub struct Mesh {
    self_id: PeerId,
    connections: Rc<ConnectionManager>,
    discovery: Rc<PeerDiscovery>,
    gossip: Rc<GossipManager>,
    dht: Rc<Dht>,
    crypto: Rc<CryptoManager>,
    signaling: SignalingHandler,
    events_rx: Option<mpsc::UnboundedReceiver<MeshEvent>>,
}

impl Mesh {
    /// Builds a mesh with a freshly generated keypair.
    pub fn new(
        self_id: PeerId,
        config: MeshConfig,
        transport: Rc<dyn Transport>,
        signaling_sender: Rc<dyn SignalingSender>,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
    ) -> Self {
        Self::build(self_id, config, transport, signaling_sender, clock, spawner, Keypair::generate())
    }

    /// Builds a mesh restoring a previously exported keypair.
    pub fn with_keypair(
        self_id: PeerId,
        config: MeshConfig,
        transport: Rc<dyn Transport>,
        signaling_sender: Rc<dyn SignalingSender>,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
        export: &KeypairExport,
    ) -> MeshResult<Self> {
        let keypair = Keypair::from_export(export)?;
        Ok(Self::build(self_id, config, transport, signaling_sender, clock, spawner, keypair))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        self_id: PeerId,
        config: MeshConfig,
        transport: Rc<dyn Transport>,
        signaling_sender: Rc<dyn SignalingSender>,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
        keypair: Keypair,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();

        let connections = ConnectionManager::new(
            self_id,
            config.connection,
            transport,
            crate::transport::IceConfig::default(),
            Rc::clone(&clock),
            Rc::clone(&spawner),
            signaling_sender,
            events_tx.clone(),
        );
        let discovery = PeerDiscovery::new(
            self_id,
            config.discovery,
            Rc::clone(&clock),
            Rc::clone(&spawner),
            events_tx.clone(),
        );
        let gossip = GossipManager::new(
            self_id,
            config.gossip,
            Rc::clone(&clock),
            Rc::clone(&spawner),
            Rc::clone(&connections) as Rc<dyn crate::gossip::PeerRegistry>,
            events_tx.clone(),
        );
        let dht = Dht::new(
            self_id,
            config.dht,
            Rc::clone(&clock),
            Rc::clone(&spawner),
            Rc::clone(&connections) as Rc<dyn crate::dht::PeerRegistry>,
            events_tx.clone(),
        );
        let crypto =
            CryptoManager::new(self_id, keypair, Rc::clone(&clock), Rc::clone(&spawner), events_tx.clone());

        // Wire the leaf-capability interfaces. Each bind_*
        // call below closes one of the cycles Mesh::dispose later breaks.
        connections.bind_discovery(Rc::clone(&discovery) as Rc<dyn crate::discovery::DiscoverySource>);
        connections.bind_frame_router(Rc::new(Router { gossip: Rc::clone(&gossip), dht: Rc::clone(&dht) }));
        connections.bind_key_exchange(Rc::clone(&crypto) as Rc<dyn crate::connection::KeyExchangeScheduler>);
        discovery.bind_connections(Rc::clone(&connections) as Rc<dyn crate::discovery::ConnectionRequester>);
        gossip.bind_discovery(Rc::clone(&discovery) as Rc<dyn crate::gossip::PeerAnnouncementSink>);
        gossip.bind_dht(Rc::clone(&dht) as Rc<dyn crate::gossip::DhtRoutingSink>);
        gossip.bind_crypto(Rc::clone(&crypto) as Rc<dyn crate::gossip::GossipCrypto>);
        crypto.bind_gossip(Rc::clone(&gossip) as Rc<dyn crate::gossip::GossipSender>);
        crypto.bind_key_holder(Rc::clone(&connections) as Rc<dyn crate::crypto::KeyHolderNotify>);

        let signaling = SignalingHandler::new(self_id, Rc::clone(&discovery), Rc::clone(&connections));

        Self { self_id, connections, discovery, gossip, dht, crypto, signaling, events_rx: Some(events_rx) }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Takes ownership of the event stream. Panics if called twice; this
    /// is a single-owner handle, not something reacquired per call.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<MeshEvent> {
        self.events_rx.take().expect("Mesh::events already taken")
    }

    /// Inbound signaling entry point.
    pub async fn handle_signaling_message(&self, envelope: SignalingEnvelope) {
        self.signaling.handle(envelope).await;
    }

    pub async fn connect_to_peer(&self, target: PeerId) {
        self.connections.connect_to_peer(target).await;
    }

    pub async fn disconnect_peer(&self, peer: PeerId, reason: String) {
        self.connections.disconnect_peer(peer, reason).await;
    }

    pub async fn set_local_stream(&self, media: Option<crate::peer::LocalMedia>) {
        self.connections.set_local_stream(media).await;
    }

    /// Broadcasts a chat/application message to every open peer.
    pub fn broadcast(&self, content: serde_json::Value) -> MeshResult<()> {
        self.gossip.broadcast(content, GossipSubtype::Chat)?;
        Ok(())
    }

    /// Sends an end-to-end encrypted direct message.
    pub fn send_dm(&self, to: PeerId, content: &serde_json::Value) -> MeshResult<()> {
        let envelope = self.crypto.encrypt_for_peer(to, content)?;
        let wire = serde_json::to_value(envelope).map_err(|e| crate::error::MeshError::Crypto(e.to_string()))?;
        self.gossip.send_directed(to, wire, GossipSubtype::Encrypted);
        Ok(())
    }

    pub fn dht_put(&self, key: String, value: serde_json::Value) {
        self.dht.put(key, value);
    }

    pub async fn dht_get(&self, key: &str, force_refresh: bool) -> Option<DhtRecord> {
        self.dht.get(key, force_refresh).await
    }

    pub fn export_keypair(&self) -> KeypairExport {
        self.crypto.export_keypair()
    }

    /// Tears down every subcomponent's back-reference so the `Rc` graph
    /// this facade built is free to drop, matching `Jason::dispose`.
    pub fn dispose(self) {
        self.connections.dispose();
        self.discovery.dispose();
        self.gossip.dispose();
        self.crypto.dispose();
    }
}
