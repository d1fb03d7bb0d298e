//! Handshake state machine.

/// States a [`super::PeerLink`] moves through linearly; `Closed` is
/// terminal and reachable from any other state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    New,
    /// Local offer created and set, awaiting an answer.
    Offered,
    /// Remote offer received, local answer created and set.
    Answered,
    /// Both descriptions set; signaling is done, waiting for the data
    /// channel.
    Stable,
    /// Data channel open; the link is usable.
    ChannelOpen,
    Closed,
}

impl HandshakeState {
    /// True once past `Stable` i.e. the SDP/ICE handshake itself has
    /// finished (independent of whether the data channel has opened yet).
    pub fn is_negotiated(self) -> bool {
        matches!(self, Self::Stable | Self::ChannelOpen)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}
