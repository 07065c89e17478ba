//! RLPx session driver -- crypto handshake over a byte stream, then the
//! framed message loop around a [`PeerConnection`].
//!
//! The handshake packets are length-prefixed ECIES envelopes read straight
//! off the stream. Once secrets are derived the stream is wrapped in a
//! [`FrameCodec`] and every message goes through the sans-IO connection
//! state machine, which decides what to write back and what to surface.
//!
//! Keepalive: a DevP2P Ping every 15s; no inbound traffic for 60s ends the
//! session with `Timeout`, as does a Hello that doesn't arrive in time.

use std::time::Duration;

use anyhow::Context;
use ethspv_crypto::ecies;
use ethspv_crypto::handshake::{Initiator, Responder};
use ethspv_crypto::NodeKey;
use ethspv_peer::{ConnectionState, PeerConnection, PeerEvent};
use ethspv_protocol::messages::{DisconnectReason, LesMessage};
use ethspv_protocol::{FrameCodec, NodeId, ProtocolError, RawMessage, CURRENT_PARAMS};
use futures_util::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;

use crate::NodeEvent;

/// Instructions from the rest of the node to one session.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Send(LesMessage),
    Disconnect(DisconnectReason),
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: DisconnectReason,
    /// Whether the Hello exchange ever completed.
    pub ready: bool,
}

/// Timing knobs for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimers {
    pub hello_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(CURRENT_PARAMS.handshake_timeout_secs),
            ping_interval: Duration::from_secs(CURRENT_PARAMS.ping_interval_secs),
            idle_timeout: Duration::from_secs(CURRENT_PARAMS.idle_timeout_secs),
        }
    }
}

// ============================================================================
// Crypto handshake
// ============================================================================

/// Read one size-prefixed handshake packet, prefix included.
async fn read_packet<T: AsyncRead + Unpin>(stream: &mut T) -> std::io::Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;
    let mut packet = vec![0u8; ecies::envelope_len(prefix)];
    packet[..2].copy_from_slice(&prefix);
    stream.read_exact(&mut packet[2..]).await?;
    Ok(packet)
}

/// Dialing side: send Auth, read AuthAck, derive secrets.
pub async fn initiate<T>(
    key: &NodeKey,
    remote: NodeId,
    mut stream: T,
) -> anyhow::Result<Framed<T, FrameCodec>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let initiator = Initiator::new(key, remote, &mut OsRng)?;
    stream
        .write_all(initiator.auth_packet())
        .await
        .context("writing auth")?;
    let ack = read_packet(&mut stream).await.context("reading auth ack")?;
    let secrets = initiator.finish(&ack)?;
    tracing::debug!(peer = %remote, "rlpx: handshake complete (initiator)");
    Ok(Framed::new(stream, FrameCodec::new(secrets)))
}

/// Listening side: read Auth, send AuthAck, derive secrets. Returns the
/// remote identity the Auth carried.
pub async fn respond<T>(key: &NodeKey, mut stream: T) -> anyhow::Result<(NodeId, Framed<T, FrameCodec>)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let auth = read_packet(&mut stream).await.context("reading auth")?;
    let responder = Responder::accept(key, auth, &mut OsRng)?;
    stream
        .write_all(responder.ack_packet())
        .await
        .context("writing auth ack")?;
    let remote = responder.remote_id();
    tracing::debug!(peer = %remote, "rlpx: handshake complete (responder)");
    Ok((remote, Framed::new(stream, FrameCodec::new(responder.finish()))))
}

// ============================================================================
// Message loop
// ============================================================================

struct Session<T> {
    framed: Framed<T, FrameCodec>,
    conn: PeerConnection,
    events: mpsc::Sender<NodeEvent>,
    ready: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Session<T> {
    fn peer(&self) -> NodeId {
        self.conn.remote_id()
    }

    async fn write(&mut self, message: RawMessage) -> Result<(), ProtocolError> {
        self.framed.send(message).await
    }

    async fn emit(&mut self, event: NodeEvent) -> Option<DisconnectReason> {
        if self.events.send(event).await.is_err() {
            tracing::debug!(peer = %self.peer(), "rlpx: event receiver gone");
            return Some(self.close(DisconnectReason::ClientQuitting).await);
        }
        None
    }

    /// Send our Disconnect (if the state machine produces one) and flush.
    async fn close(&mut self, reason: DisconnectReason) -> DisconnectReason {
        if let Some(frame) = self.conn.disconnect(reason) {
            if let Err(e) = self.write(frame).await {
                tracing::debug!(peer = %self.peer(), "rlpx: disconnect write failed: {e}");
            }
        }
        let _ = self.framed.close().await;
        reason
    }

    async fn on_inbound(&mut self, raw: RawMessage) -> Option<DisconnectReason> {
        let events = match self.conn.on_message(raw) {
            Ok(events) => events,
            Err(e) if e.is_violation() => {
                tracing::warn!(peer = %self.peer(), "rlpx: protocol violation: {e}");
                let _ = self.write(PeerConnection::violation_disconnect()).await;
                let _ = self.framed.close().await;
                return Some(DisconnectReason::BreachOfProtocol);
            }
            Err(e) => {
                tracing::debug!(peer = %self.peer(), "rlpx: inbound after close: {e}");
                let _ = self.framed.close().await;
                return Some(match self.conn.state() {
                    ConnectionState::Disconnected(reason) => reason,
                    _ => DisconnectReason::Requested,
                });
            }
        };

        let peer = self.peer();
        for event in events {
            match event {
                PeerEvent::Send(frame) => {
                    if let Err(e) = self.write(frame).await {
                        tracing::debug!(%peer, "rlpx: write failed: {e}");
                        self.conn.on_transport_error();
                        return Some(DisconnectReason::TcpError);
                    }
                }
                PeerEvent::Ready { client_id, capabilities } => {
                    self.ready = true;
                    tracing::info!(%peer, client = %client_id, caps = capabilities.len(), "rlpx: session ready");
                    if let Some(reason) = self.emit(NodeEvent::PeerReady { peer, client_id }).await {
                        return Some(reason);
                    }
                }
                PeerEvent::Message(message) => {
                    if let Some(reason) = self.emit(NodeEvent::PeerMessage { peer, message }).await {
                        return Some(reason);
                    }
                }
                PeerEvent::Pong => tracing::trace!(%peer, "rlpx: pong"),
                PeerEvent::Disconnected(reason) => {
                    let _ = self.framed.close().await;
                    return Some(reason);
                }
            }
        }
        None
    }

    async fn on_command(&mut self, command: PeerCommand) -> Option<DisconnectReason> {
        match command {
            PeerCommand::Send(message) => {
                let frame = match self.conn.send(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(peer = %self.peer(), message = message.name(), "rlpx: send refused: {e}");
                        return None;
                    }
                };
                if let Err(e) = self.write(frame).await {
                    tracing::debug!(peer = %self.peer(), "rlpx: write failed: {e}");
                    self.conn.on_transport_error();
                    return Some(DisconnectReason::TcpError);
                }
                None
            }
            PeerCommand::Disconnect(reason) => Some(self.close(reason).await),
        }
    }
}

/// Drive a handshaken stream until the session ends.
///
/// Sends our Hello, then multiplexes inbound frames, commands, keepalive
/// and shutdown. Never returns an error: every ending is a disconnect
/// reason.
pub async fn run_session<T>(
    framed: Framed<T, FrameCodec>,
    conn: PeerConnection,
    mut commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<NodeEvent>,
    timers: SessionTimers,
    mut shutdown: broadcast::Receiver<()>,
) -> SessionSummary
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session {
        framed,
        conn,
        events,
        ready: false,
    };
    let peer = session.peer();

    let hello = match session
        .conn
        .on_connected()
        .and_then(|()| session.conn.on_handshake_complete())
    {
        Ok(hello) => hello,
        Err(e) => {
            tracing::warn!(%peer, "rlpx: cannot start session: {e}");
            return SessionSummary {
                reason: DisconnectReason::SubprotocolError,
                ready: false,
            };
        }
    };
    if let Err(e) = session.write(hello).await {
        tracing::debug!(%peer, "rlpx: hello write failed: {e}");
        return SessionSummary {
            reason: DisconnectReason::TcpError,
            ready: false,
        };
    }

    let mut keepalive =
        tokio::time::interval_at(Instant::now() + timers.ping_interval, timers.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let hello_deadline = tokio::time::sleep(timers.hello_timeout);
    tokio::pin!(hello_deadline);
    let mut last_inbound = Instant::now();

    let reason = loop {
        let ending = tokio::select! {
            inbound = session.framed.next() => match inbound {
                Some(Ok(raw)) => {
                    last_inbound = Instant::now();
                    session.on_inbound(raw).await
                }
                Some(Err(e)) => {
                    tracing::debug!(%peer, "rlpx: read failed: {e}");
                    session.conn.on_transport_error();
                    Some(DisconnectReason::TcpError)
                }
                None => {
                    tracing::debug!(%peer, "rlpx: stream closed");
                    session.conn.on_transport_error();
                    Some(DisconnectReason::TcpError)
                }
            },
            command = commands.recv() => match command {
                Some(command) => session.on_command(command).await,
                None => Some(session.close(DisconnectReason::Requested).await),
            },
            _ = &mut hello_deadline, if !session.ready => {
                tracing::info!(%peer, "rlpx: hello timed out");
                Some(session.close(DisconnectReason::Timeout).await)
            }
            _ = keepalive.tick() => {
                if last_inbound.elapsed() >= timers.idle_timeout {
                    tracing::info!(%peer, "rlpx: idle timeout");
                    Some(session.close(DisconnectReason::Timeout).await)
                } else if let Some(ping) = session.conn.ping() {
                    session.write(ping).await.err().map(|e| {
                        tracing::debug!(%peer, "rlpx: ping failed: {e}");
                        DisconnectReason::TcpError
                    })
                } else {
                    None
                }
            }
            _ = shutdown.recv() => {
                Some(session.close(DisconnectReason::ClientQuitting).await)
            }
        };
        if let Some(reason) = ending {
            break reason;
        }
    };

    tracing::info!(%peer, ?reason, ready = session.ready, "rlpx: session ended");
    SessionSummary {
        reason,
        ready: session.ready,
    }
}
