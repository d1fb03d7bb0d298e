//! End-to-end `PeerLink` handshake: two pre-linked mock connections
//! should reach `ChannelOpen` on both sides and pass a message in each
//! direction.
//!
//! Drives a `PeerConnection` through a real offer/answer round trip
//! rather than only unit-testing its pieces in isolation, using this
//! crate's injected `Clock`/`Spawner` instead of a browser test harness.

use std::rc::Rc;

use futures::StreamExt;

use meshrtc::{
    clock::tokio_impl::{TokioClock, TokioSpawner},
    id::PeerId,
    peer::{HandshakeState, PeerLink},
    transport::{mock, IceConfig},
};

fn peer_id(byte: u8) -> PeerId {
    let mut bytes = [0u8; meshrtc::id::PEER_ID_LEN];
    bytes[0] = byte;
    PeerId::from_bytes(bytes)
}

/// Both peers reach `ChannelOpen`; the data channel is usable in both
/// directions.
#[tokio::test]
async fn two_peer_handshake_reaches_channel_open_both_ways() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let clock = Rc::new(TokioClock);
            let spawner = Rc::new(TokioSpawner);
            let (mock_a, mock_b) = mock::connected_pair();

            let (link_a, mut events_a) = PeerLink::create(
                peer_id(0x02),
                true,
                &PassThrough::new(mock_a),
                IceConfig::default(),
                Rc::clone(&clock) as _,
                Rc::clone(&spawner) as _,
            );
            let (link_b, mut events_b) = PeerLink::create(
                peer_id(0x01),
                false,
                &PassThrough::new(mock_b),
                IceConfig::default(),
                Rc::clone(&clock) as _,
                Rc::clone(&spawner) as _,
            );

            let offer = link_a.create_offer().await.expect("offer");
            let answer = link_b.handle_offer(offer).await.expect("answer");
            link_a.handle_answer(answer).await.expect("handle_answer");

            // Drain both event streams until each side reports its data
            // channel open.
            wait_for_channel_open(&mut events_a).await;
            wait_for_channel_open(&mut events_b).await;

            assert_eq!(link_a.state(), HandshakeState::ChannelOpen);
            assert_eq!(link_b.state(), HandshakeState::ChannelOpen);

            link_a.send(b"hello from a").expect("send a->b");
            let msg = wait_for_message(&mut events_b).await;
            assert_eq!(msg, b"hello from a");

            link_b.send(b"hello from b").expect("send b->a");
            let msg = wait_for_message(&mut events_a).await;
            assert_eq!(msg, b"hello from b");
        })
        .await;
}

/// A second `handle_answer` after the link is already `Stable` is a
/// no-op success.
#[tokio::test]
async fn duplicate_answer_after_stable_is_a_no_op() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let clock = Rc::new(TokioClock);
            let spawner = Rc::new(TokioSpawner);
            let (mock_a, mock_b) = mock::connected_pair();

            let (link_a, _events_a) = PeerLink::create(
                peer_id(0x02),
                true,
                &PassThrough::new(mock_a),
                IceConfig::default(),
                Rc::clone(&clock) as _,
                Rc::clone(&spawner) as _,
            );
            let (link_b, _events_b) = PeerLink::create(
                peer_id(0x01),
                false,
                &PassThrough::new(mock_b),
                IceConfig::default(),
                Rc::clone(&clock) as _,
                Rc::clone(&spawner) as _,
            );

            let offer = link_a.create_offer().await.unwrap();
            let answer = link_b.handle_offer(offer).await.unwrap();
            link_a.handle_answer(answer.clone()).await.unwrap();
            assert!(link_a.handle_answer(answer).await.is_ok());
        })
        .await;
}

async fn wait_for_channel_open(
    events: &mut futures::channel::mpsc::UnboundedReceiver<meshrtc::peer::PeerEvent>,
) {
    use meshrtc::peer::PeerEvent;
    loop {
        match events.next().await.expect("stream ended before DataChannelOpen") {
            PeerEvent::DataChannelOpen => return,
            _ => continue,
        }
    }
}

async fn wait_for_message(
    events: &mut futures::channel::mpsc::UnboundedReceiver<meshrtc::peer::PeerEvent>,
) -> Vec<u8> {
    use meshrtc::peer::PeerEvent;
    loop {
        match events.next().await.expect("stream ended before Message") {
            PeerEvent::Message(bytes) => return bytes,
            _ => continue,
        }
    }
}

/// A one-shot `Transport` that hands back the single already-linked mock
/// connection it wraps. `PeerLink::create` calls `new_connection` exactly
/// once, so this avoids pulling in a full paired-transport registry just
/// for this test.
struct PassThrough(std::cell::RefCell<Option<mock::MockPeerConnection>>);

impl PassThrough {
    fn new(conn: mock::MockPeerConnection) -> Self {
        Self(std::cell::RefCell::new(Some(conn)))
    }
}

impl meshrtc::transport::Transport for PassThrough {
    fn new_connection(
        &self,
        _cfg: IceConfig,
        _initiator: bool,
    ) -> Box<dyn meshrtc::transport::PeerConnection> {
        Box::new(self.0.borrow_mut().take().expect("new_connection called more than once"))
    }
}
