//! One WebRTC peer: SDP/ICE handshake, data channel, optional media,
//! recovery.

pub mod state;

use std::{
    cell::{Cell, RefCell},
    collections::{HashSet, VecDeque},
    rc::Rc,
    time::Duration,
};

use futures::{channel::mpsc, StreamExt};
use tracing::{debug, warn};

pub use state::HandshakeState;

use crate::{
    clock::{Clock, Instant, Spawner},
    error::TransportError,
    id::PeerId,
    transport::{
        ConnectionEvent, ConnectionState, DataChannel, DataChannelEvent,
        Direction, IceCandidate, IceConfig, MediaKind, MediaTrack,
        PeerConnection, Sdp, Transport,
    },
};

/// A stream accepted from a remote peer after the loopback guard passed.
#[derive(Clone, Debug)]
pub struct RemoteStream {
    pub track: MediaTrack,
    pub source: PeerId,
}

/// Local media this link's transceivers currently carry, kept so
/// force-recovery can recreate a link "preserving the
/// last configured local media".
#[derive(Clone, Debug, Default)]
pub struct LocalMedia {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

/// Events a [`PeerLink`] emits.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    /// Emitted exactly once per link, per invariant.
    Connected,
    DataChannelOpen,
    Message(Vec<u8>),
    /// Gated by `allow_remote_stream_emission`.
    RemoteStream(RemoteStream),
    RenegotiationNeeded,
    /// At most one of this or a prior `Failed`/implicit close is ever
    /// emitted, per invariant.
    Disconnected(String),
    Failed(String),
}

struct LinkInner {
    peer_id: PeerId,
    is_initiator: bool,
    created_at: Instant,
    clock: Rc<dyn Clock>,
    spawner: Rc<dyn Spawner>,
    conn: Box<dyn PeerConnection>,
    state: Cell<HandshakeState>,
    data_channel: RefCell<Option<Box<dyn DataChannel>>>,
    data_channel_ready: Cell<bool>,
    remote_description_set: Cell<bool>,
    pending_ice: RefCell<VecDeque<IceCandidate>>,
    local_media: RefCell<LocalMedia>,
    remote_media: RefCell<Option<MediaTrack>>,
    allow_remote_stream_emission: Cell<bool>,
    connected_emitted: Cell<bool>,
    terminal_emitted: Cell<bool>,
    offer_sent_at: Cell<Option<Instant>>,
    pending_disconnect_since: Cell<Option<Instant>>,
    local_stream_id: RefCell<Option<String>>,
    local_track_ids: RefCell<HashSet<String>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl LinkInner {
    fn emit(&self, ev: PeerEvent) {
        let _ = self.events_tx.unbounded_send(ev);
    }

    fn emit_terminal_disconnect(&self, reason: String) {
        if !self.terminal_emitted.replace(true) {
            self.state.set(HandshakeState::Closed);
            self.emit(PeerEvent::Disconnected(reason));
        }
    }

    fn emit_terminal_failed(&self, reason: String) {
        if !self.terminal_emitted.replace(true) {
            self.state.set(HandshakeState::Closed);
            self.emit(PeerEvent::Failed(reason));
        }
    }
}

/// Validates a candidate remote stream against the loopback guard:
///
/// (a) stream ID differs from the local stream ID,
/// (b) track ID is not one of the local track IDs,
/// (c) the receiving transceiver is not `sendonly`,
/// (d) the stream is not marked local-origin.
pub fn accept_remote_stream(
    local_stream_id: Option<&str>,
    local_track_ids: &HashSet<String>,
    transceiver_direction: Direction,
    track: &MediaTrack,
) -> bool {
    if local_stream_id == Some(track.stream_id.as_str()) {
        return false;
    }
    if local_track_ids.contains(&track.track_id) {
        return false;
    }
    if transceiver_direction == Direction::SendOnly {
        return false;
    }
    if track.local_origin {
        return false;
    }
    true
}

/// One direct peer connection: SDP/ICE handshake, data channel, optional
/// media, recovery.
#[derive(Clone)]
pub struct PeerLink(Rc<LinkInner>);

impl PeerLink {
    /// `create(initiator)`: prepares the connection,
    /// pre-allocates one audio and one video transceiver in `sendrecv`,
    /// and either creates the data channel (initiator) or waits for the
    /// remote one.
    pub fn create(
        peer_id: PeerId,
        is_initiator: bool,
        transport: &dyn Transport,
        ice_cfg: IceConfig,
        clock: Rc<dyn Clock>,
        spawner: Rc<dyn Spawner>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let conn = transport.new_connection(ice_cfg, is_initiator);
        conn.add_transceiver(MediaKind::Audio, Direction::SendRecv);
        conn.add_transceiver(MediaKind::Video, Direction::SendRecv);

        let (events_tx, events_rx) = mpsc::unbounded();
        let inner = Rc::new(LinkInner {
            peer_id,
            is_initiator,
            created_at: clock.now(),
            clock: Rc::clone(&clock),
            spawner: Rc::clone(&spawner),
            conn,
            state: Cell::new(HandshakeState::New),
            data_channel: RefCell::new(None),
            data_channel_ready: Cell::new(false),
            remote_description_set: Cell::new(false),
            pending_ice: RefCell::new(VecDeque::new()),
            local_media: RefCell::new(LocalMedia::default()),
            remote_media: RefCell::new(None),
            allow_remote_stream_emission: Cell::new(false),
            connected_emitted: Cell::new(false),
            terminal_emitted: Cell::new(false),
            offer_sent_at: Cell::new(None),
            pending_disconnect_since: Cell::new(None),
            local_stream_id: RefCell::new(None),
            local_track_ids: RefCell::new(HashSet::new()),
            events_tx,
        });

        Self::pump_connection_events(&inner);

        if is_initiator {
            let dc = inner.conn.create_data_channel();
            Self::pump_data_channel(&inner, dc);
        }

        (Self(inner), events_rx)
    }

    fn pump_connection_events(inner: &Rc<LinkInner>) {
        let inner = Rc::clone(inner);
        let mut stream = inner.conn.events();
        let pump = Rc::clone(&inner);
        inner.spawner.spawn(Box::pin(async move {
            while let Some(ev) = stream.next().await {
                Self::handle_connection_event(&pump, ev);
            }
        }));
    }

    fn handle_connection_event(inner: &Rc<LinkInner>, ev: ConnectionEvent) {
        match ev {
            ConnectionEvent::IceCandidate(c) => inner.emit(PeerEvent::IceCandidate(c)),
            ConnectionEvent::NegotiationNeeded => {
                inner.emit(PeerEvent::RenegotiationNeeded)
            }
            ConnectionEvent::SignalingStateChange(_) => {}
            ConnectionEvent::ConnectionStateChange(ConnectionState::Connected) => {
                if !inner.connected_emitted.replace(true) {
                    inner.emit(PeerEvent::Connected);
                }
                inner.pending_disconnect_since.set(None);
            }
            ConnectionEvent::ConnectionStateChange(ConnectionState::Disconnected) => {
                let since = inner.clock.now();
                inner.pending_disconnect_since.set(Some(since));
                let inner2 = Rc::clone(inner);
                let spawner = Rc::clone(&inner.spawner);
                inner.spawner.spawn(Box::pin(async move {
                    spawner.delay(Duration::from_secs(3)).await;
                    if inner2.pending_disconnect_since.get() == Some(since) {
                        inner2.emit_terminal_disconnect(
                            "connection disconnected".to_string(),
                        );
                    }
                }));
            }
            ConnectionEvent::ConnectionStateChange(ConnectionState::Failed) => {
                inner.emit_terminal_failed("transport connection failed".to_string());
            }
            ConnectionEvent::ConnectionStateChange(ConnectionState::Closed) => {
                inner.emit_terminal_disconnect("closed".to_string());
            }
            ConnectionEvent::ConnectionStateChange(ConnectionState::New) => {}
            ConnectionEvent::Track { track, transceiver_direction } => {
                let accepted = accept_remote_stream(
                    inner.local_stream_id.borrow().as_deref(),
                    &inner.local_track_ids.borrow(),
                    transceiver_direction,
                    &track,
                );
                if !accepted {
                    debug!(peer = %inner.peer_id, "dropped looped-back remote stream");
                    return;
                }
                *inner.remote_media.borrow_mut() = Some(track.clone());
                if inner.allow_remote_stream_emission.get() {
                    inner.emit(PeerEvent::RemoteStream(RemoteStream {
                        track,
                        source: inner.peer_id,
                    }));
                }
            }
            ConnectionEvent::RemoteDataChannel(dc) => {
                Self::pump_data_channel(inner, dc);
            }
        }
    }

    fn pump_data_channel(inner: &Rc<LinkInner>, dc: Box<dyn DataChannel>) {
        let mut stream = dc.events();
        *inner.data_channel.borrow_mut() = Some(dc);
        let pump = Rc::clone(inner);
        inner.spawner.spawn(Box::pin(async move {
            while let Some(ev) = stream.next().await {
                match ev {
                    DataChannelEvent::Open => {
                        pump.data_channel_ready.set(true);
                        pump.state.set(HandshakeState::ChannelOpen);
                        pump.emit(PeerEvent::DataChannelOpen);
                    }
                    DataChannelEvent::Message(bytes) => {
                        pump.emit(PeerEvent::Message(bytes));
                    }
                    DataChannelEvent::Close => {
                        pump.data_channel_ready.set(false);
                        pump.emit_terminal_disconnect(
                            "data channel closed".to_string(),
                        );
                    }
                    DataChannelEvent::Error(e) => {
                        warn!(peer = %pump.peer_id, error = %e, "data channel error");
                    }
                }
            }
        }));
    }

    pub fn peer_id(&self) -> PeerId {
        self.0.peer_id
    }

    pub fn is_initiator(&self) -> bool {
        self.0.is_initiator
    }

    pub fn created_at(&self) -> Instant {
        self.0.created_at
    }

    pub fn state(&self) -> HandshakeState {
        self.0.state.get()
    }

    pub fn data_channel_ready(&self) -> bool {
        self.0.data_channel_ready.get()
    }

    /// Sets whether remote media is surfaced as [`PeerEvent::RemoteStream`]
    /// (default `false`, ).
    pub fn set_allow_remote_stream_emission(&self, allow: bool) {
        self.0.allow_remote_stream_emission.set(allow);
    }

    /// How long the link has been waiting in `Offered` for an answer.
    /// `None` if it never sent an offer or has since moved on.
    pub fn offer_age(&self) -> Option<Duration> {
        self.0.offer_sent_at.get().map(|sent| self.0.clock.now().since(sent))
    }

    /// `create_offer()`.
    pub async fn create_offer(&self) -> Result<Sdp, TransportError> {
        let inner = Rc::clone(&self.0);
        match inner.conn.create_offer().await {
            Ok(sdp) => {
                inner.conn.set_local_description(sdp.clone()).await?;
                inner.state.set(HandshakeState::Offered);
                inner.offer_sent_at.set(Some(inner.clock.now()));
                Ok(sdp)
            }
            Err(e) => {
                inner.emit_terminal_failed(format!("create_offer: {e}"));
                Err(e)
            }
        }
    }

    /// `handle_offer(sdp)`: only valid before any local
    /// offer/answer has been produced.
    pub async fn handle_offer(&self, sdp: Sdp) -> Result<Sdp, TransportError> {
        let inner = Rc::clone(&self.0);
        if inner.state.get() != HandshakeState::New {
            return Err(TransportError::SetRemoteDescription(
                "handle_offer called outside New state".to_string(),
            ));
        }
        let result: Result<Sdp, TransportError> = async {
            inner.conn.set_remote_description(sdp).await?;
            inner.remote_description_set.set(true);
            self.flush_pending_ice().await;
            let answer = inner.conn.create_answer().await?;
            inner.conn.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;
        match result {
            Ok(answer) => {
                inner.state.set(HandshakeState::Answered);
                Ok(answer)
            }
            Err(e) => {
                inner.emit_terminal_failed(format!("handle_offer: {e}"));
                Err(e)
            }
        }
    }

    /// `handle_answer(sdp)`: a no-op success if already
    /// `Stable`.
    pub async fn handle_answer(&self, sdp: Sdp) -> Result<(), TransportError> {
        let inner = Rc::clone(&self.0);
        if inner.state.get() == HandshakeState::Stable
            || inner.state.get() == HandshakeState::ChannelOpen
        {
            return Ok(());
        }
        if inner.state.get() != HandshakeState::Offered {
            return Err(TransportError::SetRemoteDescription(
                "handle_answer called outside Offered state".to_string(),
            ));
        }
        let result = async {
            inner.conn.set_remote_description(sdp).await?;
            inner.remote_description_set.set(true);
            self.flush_pending_ice().await;
            Ok::<_, TransportError>(())
        }
        .await;
        match result {
            Ok(()) => {
                inner.state.set(HandshakeState::Stable);
                Ok(())
            }
            Err(e) => {
                inner.emit_terminal_failed(format!("handle_answer: {e}"));
                Err(e)
            }
        }
    }

    /// `handle_ice(candidate)`: buffered until the remote
    /// description is set, then applied in arrival order. ICE failures
    /// are logged, never propagated.
    pub async fn handle_ice(&self, candidate: IceCandidate) {
        if !self.0.remote_description_set.get() {
            self.0.pending_ice.borrow_mut().push_back(candidate);
            return;
        }
        if let Err(e) = self.0.conn.add_ice_candidate(candidate).await {
            warn!(peer = %self.0.peer_id, error = %e, "ICE candidate rejected");
        }
    }

    async fn flush_pending_ice(&self) {
        let queued: Vec<_> = self.0.pending_ice.borrow_mut().drain(..).collect();
        for c in queued {
            if let Err(e) = self.0.conn.add_ice_candidate(c).await {
                warn!(peer = %self.0.peer_id, error = %e, "buffered ICE candidate rejected");
            }
        }
    }

    /// `set_local_stream`: replaces tracks on the
    /// pre-allocated transceivers, never adding/removing them, and
    /// triggers `RenegotiationNeeded`.
    pub fn set_local_stream(&self, media: Option<LocalMedia>) {
        let media = media.unwrap_or_default();
        self.0.conn.replace_track(MediaKind::Audio, media.audio.clone());
        self.0.conn.replace_track(MediaKind::Video, media.video.clone());

        let mut track_ids = HashSet::new();
        let mut stream_id = None;
        for t in [&media.audio, &media.video].into_iter().flatten() {
            stream_id.get_or_insert_with(|| t.stream_id.clone());
            track_ids.insert(t.track_id.clone());
        }
        *self.0.local_stream_id.borrow_mut() = stream_id;
        *self.0.local_track_ids.borrow_mut() = track_ids;
        *self.0.local_media.borrow_mut() = media;
    }

    pub fn local_media(&self) -> LocalMedia {
        self.0.local_media.borrow().clone()
    }

    /// `send()`: succeeds only if the data channel is
    /// open.
    pub fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        match self.0.data_channel.borrow().as_ref() {
            Some(dc) if dc.is_open() => dc.send(bytes),
            _ => Err(TransportError::ChannelNotOpen),
        }
    }

    pub fn close(&self) {
        self.0.conn.close();
        self.0.emit_terminal_disconnect("closed locally".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MediaTrack;

    fn track(id: &str, stream: &str, local_origin: bool) -> MediaTrack {
        MediaTrack {
            track_id: id.to_string(),
            stream_id: stream.to_string(),
            kind: MediaKind::Video,
            local_origin,
        }
    }

    #[test]
    fn rejects_own_stream_id() {
        let mut ids = HashSet::new();
        ids.insert("other-track".to_string());
        assert!(!accept_remote_stream(
            Some("my-stream"),
            &ids,
            Direction::SendRecv,
            &track("other-track", "my-stream", false),
        ));
    }

    #[test]
    fn rejects_own_track_id() {
        let mut ids = HashSet::new();
        ids.insert("my-track".to_string());
        assert!(!accept_remote_stream(
            Some("my-stream"),
            &ids,
            Direction::SendRecv,
            &track("my-track", "remote-stream", false),
        ));
    }

    #[test]
    fn rejects_sendonly_transceiver() {
        assert!(!accept_remote_stream(
            None,
            &HashSet::new(),
            Direction::SendOnly,
            &track("t", "s", false),
        ));
    }

    #[test]
    fn rejects_local_origin_flag() {
        assert!(!accept_remote_stream(
            None,
            &HashSet::new(),
            Direction::SendRecv,
            &track("t", "s", true),
        ));
    }

    #[test]
    fn accepts_genuine_remote_stream() {
        assert!(accept_remote_stream(
            Some("my-stream"),
            &HashSet::new(),
            Direction::SendRecv,
            &track("remote-track", "remote-stream", false),
        ));
    }
}
