//! Swarm task -- TCP listener, outbound dialer and session spawning.
//!
//! Every live connection is one tokio task running [`run_session`]. The
//! swarm registers it in the [`PeerPool`], reports its end to the sync
//! coordinator and feeds the outcome back into the node table: a session
//! that got through Hello scores the node up, anything less retires it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethspv_crypto::NodeKey;
use ethspv_peer::{LocalHello, NodeTable, PeerConnection};
use ethspv_protocol::discovery::Node;
use ethspv_protocol::{FrameCodec, NodeId};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;

use crate::peer_pool::{Direction, PeerHandle, PeerPool};
use crate::rlpx::{self, run_session, SessionTimers};
use crate::NodeEvent;

/// Commands buffered per session before senders wait.
const COMMAND_BUFFER: usize = 64;

#[derive(Clone)]
pub struct Swarm {
    key: Arc<NodeKey>,
    hello: LocalHello,
    pool: PeerPool,
    table: Arc<Mutex<NodeTable>>,
    events: mpsc::Sender<NodeEvent>,
    shutdown: broadcast::Sender<()>,
    max_peers: usize,
    timers: SessionTimers,
    /// Outbound handshakes in progress, counted against `max_peers`.
    dialing: Arc<AtomicUsize>,
}

impl Swarm {
    pub fn new(
        key: Arc<NodeKey>,
        hello: LocalHello,
        pool: PeerPool,
        table: Arc<Mutex<NodeTable>>,
        events: mpsc::Sender<NodeEvent>,
        shutdown: broadcast::Sender<()>,
        max_peers: usize,
    ) -> Self {
        Self {
            key,
            hello,
            pool,
            table,
            events,
            shutdown,
            max_peers,
            timers: SessionTimers::default(),
            dialing: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.key.node_id()
    }

    /// Connect and run the crypto handshake; the session then runs in its
    /// own task.
    pub async fn dial(&self, node: Node) -> anyhow::Result<()> {
        if node.id == self.local_id() {
            anyhow::bail!("refusing to dial self");
        }
        let addr = node.endpoint.tcp_addr();
        let handshake = async {
            let stream = TcpStream::connect(addr).await?;
            rlpx::initiate(&self.key, node.id, stream).await
        };
        let framed = tokio::time::timeout(self.timers.hello_timeout, handshake)
            .await
            .map_err(|_| anyhow::anyhow!("handshake with {addr} timed out"))??;
        tracing::debug!(peer = %node.id, %addr, "swarm: dialed");
        self.spawn_session(framed, node.id, addr, Direction::Outbound);
        Ok(())
    }

    /// Answer an inbound connection.
    pub async fn accept(&self, stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let connected = self.pool.len().await;
        if connected >= self.max_peers {
            anyhow::bail!("pool full ({connected} peers)");
        }
        let (remote, framed) =
            tokio::time::timeout(self.timers.hello_timeout, rlpx::respond(&self.key, stream))
                .await
                .map_err(|_| anyhow::anyhow!("handshake with {addr} timed out"))??;
        if remote == self.local_id() {
            anyhow::bail!("connection from self");
        }
        tracing::debug!(peer = %remote, %addr, "swarm: accepted");
        self.spawn_session(framed, remote, addr, Direction::Inbound);
        Ok(())
    }

    fn spawn_session(
        &self,
        framed: Framed<TcpStream, FrameCodec>,
        remote: NodeId,
        addr: SocketAddr,
        direction: Direction,
    ) {
        let swarm = self.clone();
        tokio::spawn(async move {
            let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
            if !swarm
                .pool
                .insert(PeerHandle::new(remote, addr, direction, cmd_tx))
                .await
            {
                // the existing session keeps the table slot
                return;
            }

            let conn = PeerConnection::new(swarm.hello.clone(), remote);
            let summary = run_session(
                framed,
                conn,
                cmd_rx,
                swarm.events.clone(),
                swarm.timers,
                swarm.shutdown.subscribe(),
            )
            .await;

            swarm.pool.remove(&remote).await;
            if direction == Direction::Outbound {
                let mut table = swarm.table.lock();
                if summary.ready {
                    table.mark_success(&remote);
                } else {
                    table.mark_failed(&remote);
                }
            }
            let closed = NodeEvent::PeerClosed {
                peer: remote,
                reason: summary.reason,
            };
            if swarm.events.send(closed).await.is_err() {
                tracing::debug!(peer = %remote, "swarm: coordinator gone");
            }
        });
    }

    /// Start dials until connected plus in-flight reaches `max_peers`.
    /// Returns how many dials were started.
    pub async fn fill_slots(&self) -> usize {
        let busy = self.pool.len().await + self.dialing.load(Ordering::SeqCst);
        let free = self.max_peers.saturating_sub(busy);
        if free > 0 && !self.table.lock().has_fresh() {
            tracing::debug!(busy, known = self.table.lock().len(), "swarm: no dialable nodes");
            return 0;
        }
        let mut started = 0;
        for _ in 0..free {
            let Some(node) = self.table.lock().next_for_connection() else {
                break;
            };
            started += 1;
            self.dialing.fetch_add(1, Ordering::SeqCst);
            let swarm = self.clone();
            tokio::spawn(async move {
                if let Err(e) = swarm.dial(node).await {
                    tracing::debug!(peer = %node.id, addr = %node.endpoint.tcp_addr(), "swarm: dial failed: {e:#}");
                    swarm.table.lock().mark_failed(&node.id);
                }
                swarm.dialing.fetch_sub(1, Ordering::SeqCst);
            });
        }
        if started > 0 {
            tracing::debug!(started, busy, "swarm: dialing");
        }
        started
    }
}

/// Accept loop -- one task per inbound connection.
pub async fn run_listener(swarm: Swarm, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "swarm: listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let swarm = swarm.clone();
                    tokio::spawn(async move {
                        if let Err(e) = swarm.accept(stream, addr).await {
                            tracing::debug!(%addr, "swarm: inbound rejected: {e:#}");
                        }
                    });
                }
                Err(e) => tracing::warn!("swarm: accept failed: {e}"),
            },
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal, stopping accept loop");
                break;
            }
        }
    }
}

/// Dial loop -- tops up outbound sessions from the node table.
pub async fn run_dialer(swarm: Swarm, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                swarm.fill_slots().await;
            }
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal, stopping dialer");
                break;
            }
        }
    }
}
