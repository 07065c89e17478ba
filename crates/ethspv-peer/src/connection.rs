//! Per-peer connection state machine.
//!
//! Sans-IO: the node driver owns the socket and frame codec, feeds decoded
//! frames in through [`PeerConnection::on_message`] and writes out whatever
//! [`PeerEvent::Send`] asks for.
//!
//! Lifecycle: Connecting -> Handshaking -> Ready -> Disconnected. The
//! terminal state is sticky; a new connection object is needed to retry.

use ethspv_protocol::messages::{
    DisconnectReason, Hello, LesMessage, P2pMessage, BASE_PROTOCOL_LENGTH, DISCONNECT, HELLO,
    PING, PONG,
};
use ethspv_protocol::{Capability, NodeId, RawMessage, CURRENT_PARAMS};

use crate::negotiation::{agreed_capabilities, MessageIdMap};
use crate::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Crypto handshake and Hello exchange in progress.
    Handshaking,
    Ready,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected(_) => "disconnected",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

/// What the local side advertises in Hello.
#[derive(Debug, Clone)]
pub struct LocalHello {
    pub node_id: NodeId,
    pub client_id: String,
    pub listen_port: u16,
    pub capabilities: Vec<Capability>,
}

impl LocalHello {
    pub fn light_client(node_id: NodeId, client_id: impl Into<String>, listen_port: u16) -> Self {
        Self {
            node_id,
            client_id: client_id.into(),
            listen_port,
            capabilities: vec![Capability::les2()],
        }
    }

    fn to_hello(&self) -> Hello {
        Hello {
            p2p_version: CURRENT_PARAMS.p2p_version,
            client_id: self.client_id.clone(),
            capabilities: self.capabilities.clone(),
            listen_port: self.listen_port,
            node_id: self.node_id,
        }
    }
}

/// Output of feeding a message into the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Frame to write to the peer.
    Send(RawMessage),
    /// Hello exchange completed with a usable capability set.
    Ready {
        client_id: String,
        capabilities: Vec<Capability>,
    },
    /// A LES message from a Ready peer.
    Message(LesMessage),
    /// Keepalive answer received.
    Pong,
    /// Connection is over; the driver should close the socket.
    Disconnected(DisconnectReason),
}

fn p2p_frame(message: &P2pMessage) -> RawMessage {
    RawMessage::new(message.code(), message.encode_payload())
}

pub struct PeerConnection {
    local: LocalHello,
    remote_id: NodeId,
    state: ConnectionState,
    ids: MessageIdMap,
    remote_client: Option<String>,
}

impl PeerConnection {
    pub fn new(local: LocalHello, remote_id: NodeId) -> Self {
        Self {
            local,
            remote_id,
            state: ConnectionState::Connecting,
            ids: MessageIdMap::default(),
            remote_client: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    pub fn remote_client(&self) -> Option<&str> {
        self.remote_client.as_deref()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.ids.capabilities()
    }

    /// Transport connected: start the crypto handshake.
    pub fn on_connected(&mut self) -> Result<(), PeerError> {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Handshaking;
                Ok(())
            }
            other => Err(PeerError::InvalidState {
                operation: "on_connected",
                state: other.name(),
            }),
        }
    }

    /// Crypto handshake done: returns the Hello to send.
    pub fn on_handshake_complete(&mut self) -> Result<RawMessage, PeerError> {
        match self.state {
            ConnectionState::Handshaking => {
                Ok(p2p_frame(&P2pMessage::Hello(self.local.to_hello())))
            }
            other => Err(PeerError::InvalidState {
                operation: "on_handshake_complete",
                state: other.name(),
            }),
        }
    }

    /// Feed one inbound message.
    ///
    /// Errors leave the connection Disconnected; the driver should send
    /// [`PeerConnection::violation_disconnect`] if the transport is still up.
    pub fn on_message(&mut self, message: RawMessage) -> Result<Vec<PeerEvent>, PeerError> {
        if let ConnectionState::Disconnected(_) = self.state {
            return Err(PeerError::Closed);
        }
        let result = self.dispatch(message);
        if result.is_err() {
            self.state = ConnectionState::Disconnected(DisconnectReason::BreachOfProtocol);
        }
        result
    }

    fn dispatch(&mut self, message: RawMessage) -> Result<Vec<PeerEvent>, PeerError> {
        if message.code < BASE_PROTOCOL_LENGTH {
            return self.on_base_message(message);
        }
        if !self.state.is_ready() {
            return Err(PeerError::UnexpectedMessage {
                code: message.code,
                state: self.state.name(),
            });
        }

        match self.ids.resolve(message.code) {
            Some((cap, relative)) if *cap == Capability::les2() => {
                let decoded = LesMessage::decode(relative, &message.payload)?;
                tracing::trace!(peer = %self.remote_id, message = decoded.name(), "peer: les message");
                Ok(vec![PeerEvent::Message(decoded)])
            }
            Some((cap, relative)) => {
                tracing::trace!(peer = %self.remote_id, %cap, relative, "peer: ignoring message");
                Ok(Vec::new())
            }
            None => Err(PeerError::UnexpectedMessage {
                code: message.code,
                state: self.state.name(),
            }),
        }
    }

    fn on_base_message(&mut self, message: RawMessage) -> Result<Vec<PeerEvent>, PeerError> {
        let early = !self.state.is_ready() && !allowed_before_ready(message.code);
        if early || matches!(self.state, ConnectionState::Connecting) {
            return Err(PeerError::UnexpectedMessage {
                code: message.code,
                state: self.state.name(),
            });
        }

        match P2pMessage::decode(message.code, &message.payload)? {
            P2pMessage::Hello(hello) => self.on_hello(hello),
            P2pMessage::Disconnect(reason) => {
                tracing::debug!(peer = %self.remote_id, ?reason, "peer: remote disconnected");
                self.state = ConnectionState::Disconnected(reason);
                Ok(vec![PeerEvent::Disconnected(reason)])
            }
            P2pMessage::Ping => Ok(vec![PeerEvent::Send(p2p_frame(&P2pMessage::Pong))]),
            P2pMessage::Pong => Ok(vec![PeerEvent::Pong]),
        }
    }

    fn on_hello(&mut self, hello: Hello) -> Result<Vec<PeerEvent>, PeerError> {
        if self.state.is_ready() {
            return Err(PeerError::UnexpectedMessage {
                code: HELLO,
                state: self.state.name(),
            });
        }
        if hello.node_id != self.remote_id {
            return Ok(self.close(DisconnectReason::UnexpectedIdentity));
        }

        let shared = agreed_capabilities(&self.local.capabilities, &hello.capabilities);
        if !shared.contains(&Capability::les2()) {
            tracing::debug!(
                peer = %self.remote_id,
                client = %hello.client_id,
                shared = shared.len(),
                "peer: no usable capability"
            );
            return Ok(self.close(DisconnectReason::UselessPeer));
        }

        self.ids = MessageIdMap::new(&shared);
        self.remote_client = Some(hello.client_id.clone());
        self.state = ConnectionState::Ready;
        tracing::info!(peer = %self.remote_id, client = %hello.client_id, "peer: ready");
        Ok(vec![PeerEvent::Ready {
            client_id: hello.client_id,
            capabilities: shared,
        }])
    }

    /// Send a Disconnect and move to the terminal state.
    fn close(&mut self, reason: DisconnectReason) -> Vec<PeerEvent> {
        self.state = ConnectionState::Disconnected(reason);
        vec![
            PeerEvent::Send(p2p_frame(&P2pMessage::Disconnect(reason))),
            PeerEvent::Disconnected(reason),
        ]
    }

    /// Encode a LES message with the negotiated id offset.
    pub fn send(&self, message: &LesMessage) -> Result<RawMessage, PeerError> {
        if !self.state.is_ready() {
            return Err(PeerError::InvalidState {
                operation: "send",
                state: self.state.name(),
            });
        }
        let offset = self
            .ids
            .offset(ethspv_protocol::capability::LES)
            .ok_or(PeerError::InvalidState {
                operation: "send",
                state: "no les capability",
            })?;
        Ok(RawMessage::new(offset + message.code(), message.encode_payload()))
    }

    /// Keepalive ping; only meaningful once frames are flowing.
    pub fn ping(&self) -> Option<RawMessage> {
        matches!(self.state, ConnectionState::Handshaking | ConnectionState::Ready)
            .then(|| p2p_frame(&P2pMessage::Ping))
    }

    /// Locally initiated disconnect. Returns the frame to send, if the
    /// session had got far enough to carry one.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> Option<RawMessage> {
        let was = self.state;
        if was.is_closed() {
            return None;
        }
        self.state = ConnectionState::Disconnected(reason);
        tracing::debug!(peer = %self.remote_id, ?reason, from = was.name(), "peer: disconnecting");
        matches!(was, ConnectionState::Handshaking | ConnectionState::Ready)
            .then(|| p2p_frame(&P2pMessage::Disconnect(reason)))
    }

    /// Disconnect frame for a peer that broke protocol.
    pub fn violation_disconnect() -> RawMessage {
        p2p_frame(&P2pMessage::Disconnect(DisconnectReason::BreachOfProtocol))
    }

    /// Transport failed underneath us.
    pub fn on_transport_error(&mut self) {
        if !self.state.is_closed() {
            self.state = ConnectionState::Disconnected(DisconnectReason::TcpError);
        }
    }
}

/// Whether a base-protocol code may arrive before Ready.
pub fn allowed_before_ready(code: u64) -> bool {
    matches!(code, HELLO | DISCONNECT | PING | PONG)
}
