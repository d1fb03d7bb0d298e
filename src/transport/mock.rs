//! In-memory loopback [`Transport`], used only by this crate's own test
//! suite.
//!
//! Two [`MockPeerConnection`]s are linked with [`link`] before either
//! side starts the handshake; signaling messages (offer/answer/ICE) still
//! have to be relayed by the test through whatever `SignalingHandler`
//! plumbing it is exercising — this mock only fakes the WebRTC stack
//! itself, not the signaling relay.

use std::{cell::RefCell, rc::Rc};

use futures::{
    channel::mpsc, future::LocalBoxFuture, stream::LocalBoxStream, FutureExt,
    StreamExt,
};

use super::{
    ConnectionEvent, ConnectionState, DataChannel, DataChannelEvent,
    Direction, IceCandidate, IceConfig, MediaKind, MediaTrack, PeerConnection,
    Sdp, SdpType, SignalingState, Transport,
};
use crate::error::TransportError;

/// Fake SDP body satisfying validation rule (non-empty,
/// contains `v=0`, length ≥ 10).
fn fake_sdp(sdp_type: SdpType, conn_id: u64) -> Sdp {
    Sdp { sdp_type, sdp: format!("v=0\r\no=mock {conn_id} 0 IN IP4 0.0.0.0\r\n") }
}

/// One direction-aware half of an in-memory duplex pipe.
struct MockDataChannelInner {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: RefCell<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    open: RefCell<bool>,
}

impl MockDataChannelInner {
    /// Builds a cross-wired pair: `a`'s sends arrive on `b`'s receiver and
    /// vice versa.
    fn new_pair() -> (Rc<Self>, Rc<Self>) {
        let (tx_ab, rx_ab) = mpsc::unbounded();
        let (tx_ba, rx_ba) = mpsc::unbounded();
        let a = Rc::new(Self {
            tx: tx_ab,
            rx: RefCell::new(Some(rx_ba)),
            open: RefCell::new(false),
        });
        let b = Rc::new(Self {
            tx: tx_ba,
            rx: RefCell::new(Some(rx_ab)),
            open: RefCell::new(false),
        });
        (a, b)
    }

    fn mark_open(&self) {
        *self.open.borrow_mut() = true;
    }
}

struct Inner {
    id: u64,
    signaling_state: SignalingState,
    connection_state: ConnectionState,
    transceivers: Vec<(MediaKind, Direction)>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    /// This side's half of the data channel pipe, wired up by [`link`].
    own_dc: Option<Rc<MockDataChannelInner>>,
    /// The peer's half + its event sender, so that creating the channel
    /// on one side can notify the other with `RemoteDataChannel`.
    remote: Option<(Rc<MockDataChannelInner>, mpsc::UnboundedSender<ConnectionEvent>)>,
}

/// A loopback `RTCPeerConnection`-equivalent.
pub struct MockPeerConnection(Rc<RefCell<Inner>>);

static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl MockPeerConnection {
    fn new(_initiator: bool) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self(Rc::new(RefCell::new(Inner {
            id: NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            signaling_state: SignalingState::Stable,
            connection_state: ConnectionState::New,
            transceivers: Vec::new(),
            event_tx: tx,
            event_rx: Some(rx),
            own_dc: None,
            remote: None,
        })))
    }

    fn event_tx(&self) -> mpsc::UnboundedSender<ConnectionEvent> {
        self.0.borrow().event_tx.clone()
    }
}

/// Links two freshly-created mock connections so that opening a data
/// channel on one surfaces `RemoteDataChannel` on the other, and setting
/// each side's remote description to `Stable` marks both `Connected`.
pub fn link(a: &MockPeerConnection, b: &MockPeerConnection) {
    let (dc_a, dc_b) = MockDataChannelInner::new_pair();
    let a_tx = a.event_tx();
    let b_tx = b.event_tx();
    a.0.borrow_mut().own_dc = Some(dc_a);
    a.0.borrow_mut().remote = Some((dc_b.clone(), b_tx));
    b.0.borrow_mut().own_dc = Some(dc_b);
    b.0.borrow_mut().remote = Some((a.0.borrow().own_dc.clone().unwrap(), a_tx));
}

impl PeerConnection for MockPeerConnection {
    fn create_offer(&self) -> LocalBoxFuture<'_, Result<Sdp, TransportError>> {
        let id = self.0.borrow().id;
        async move { Ok(fake_sdp(SdpType::Offer, id)) }.boxed_local()
    }

    fn create_answer(&self) -> LocalBoxFuture<'_, Result<Sdp, TransportError>> {
        let (id, state) = {
            let inner = self.0.borrow();
            (inner.id, inner.signaling_state)
        };
        async move {
            if state != SignalingState::HaveRemoteOffer {
                return Err(TransportError::CreateAnswer(
                    "no remote offer set".into(),
                ));
            }
            Ok(fake_sdp(SdpType::Answer, id))
        }
        .boxed_local()
    }

    fn set_local_description(
        &self,
        sdp: Sdp,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        let this = Rc::clone(&self.0);
        async move {
            let mut inner = this.borrow_mut();
            inner.signaling_state = match sdp.sdp_type {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                SdpType::Answer => SignalingState::Stable,
            };
            Ok(())
        }
        .boxed_local()
    }

    fn set_remote_description(
        &self,
        sdp: Sdp,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        let this = Rc::clone(&self.0);
        async move {
            let mut inner = this.borrow_mut();
            inner.signaling_state = match sdp.sdp_type {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                SdpType::Answer => {
                    inner.connection_state = ConnectionState::Connected;
                    let _ = inner.event_tx.unbounded_send(
                        ConnectionEvent::ConnectionStateChange(
                            ConnectionState::Connected,
                        ),
                    );
                    SignalingState::Stable
                }
            };
            Ok(())
        }
        .boxed_local()
    }

    fn add_ice_candidate(
        &self,
        _candidate: IceCandidate,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        async move { Ok(()) }.boxed_local()
    }

    fn add_transceiver(&self, kind: MediaKind, dir: Direction) {
        self.0.borrow_mut().transceivers.push((kind, dir));
    }

    fn replace_track(&self, _kind: MediaKind, _track: Option<MediaTrack>) {
        let tx = self.0.borrow().event_tx.clone();
        let _ = tx.unbounded_send(ConnectionEvent::NegotiationNeeded);
    }

    fn create_data_channel(&self) -> Box<dyn DataChannel> {
        let (own_dc, remote) = {
            let inner = self.0.borrow();
            (
                inner.own_dc.clone().expect("peer connections must be linked before use"),
                inner.remote.clone(),
            )
        };
        own_dc.mark_open();
        if let Some((remote_dc, remote_tx)) = remote {
            remote_dc.mark_open();
            let _ = remote_tx.unbounded_send(ConnectionEvent::RemoteDataChannel(
                Box::new(MockDataChannel(remote_dc)),
            ));
        }
        Box::new(MockDataChannel(own_dc))
    }

    fn signaling_state(&self) -> SignalingState {
        self.0.borrow().signaling_state
    }

    fn connection_state(&self) -> ConnectionState {
        self.0.borrow().connection_state
    }

    fn events(&self) -> LocalBoxStream<'static, ConnectionEvent> {
        let rx = self
            .0
            .borrow_mut()
            .event_rx
            .take()
            .expect("MockPeerConnection::events() called more than once");
        rx.boxed_local()
    }

    fn close(&self) {
        self.0.borrow_mut().connection_state = ConnectionState::Closed;
    }
}

/// A loopback ordered, reliable data channel.
pub struct MockDataChannel(Rc<MockDataChannelInner>);

impl DataChannel for MockDataChannel {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !*self.0.open.borrow() {
            return Err(TransportError::ChannelNotOpen);
        }
        self.0
            .tx
            .unbounded_send(bytes.to_vec())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn is_open(&self) -> bool {
        *self.0.open.borrow()
    }

    /// By the time this is called, `create_data_channel` has already
    /// marked the channel open on both sides (mock channels are born
    /// open, unlike a real negotiated one), so the first event is always
    /// `Open` — `PeerLink::pump_data_channel` waits on exactly this event
    /// to transition to `ChannelOpen`.
    fn events(&self) -> LocalBoxStream<'static, DataChannelEvent> {
        let rx = self.0.rx.borrow_mut().take();
        match rx {
            Some(rx) => futures::stream::once(futures::future::ready(DataChannelEvent::Open))
                .chain(rx.map(DataChannelEvent::Message))
                .boxed_local(),
            None => futures::stream::empty().boxed_local(),
        }
    }
}

/// `Transport` impl handing out unlinked [`MockPeerConnection`]s — pair
/// them with [`link`], or use [`connected_pair`] directly.
#[derive(Default)]
pub struct MockTransport;

impl Transport for MockTransport {
    fn new_connection(
        &self,
        _cfg: IceConfig,
        initiator: bool,
    ) -> Box<dyn PeerConnection> {
        Box::new(MockPeerConnection::new(initiator))
    }
}

/// Creates a pair of peer connections for tests, already [`link`]ed.
pub fn connected_pair() -> (MockPeerConnection, MockPeerConnection) {
    let a = MockPeerConnection::new(true);
    let b = MockPeerConnection::new(false);
    link(&a, &b);
    (a, b)
}
