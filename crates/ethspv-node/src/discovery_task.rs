//! Discovery task -- UDP node discovery feeding the node table.
//!
//! A lookup takes up to `alpha` nodes the table has never queried, opens a
//! session for each and sends Ping + FindNode(self). A Neighbors answer
//! closes the session and adds the returned nodes; a session that hears
//! nothing before its timeout gets the node dropped from the table.
//!
//! Inbound Ping is answered with Pong (echoing the packet hash) followed by
//! our own FindNode, and the sender joins the table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethspv_crypto::packet::MAX_PACKET_SIZE;
use ethspv_crypto::{open_packet, seal_packet, NodeKey};
use ethspv_peer::NodeTable;
use ethspv_protocol::discovery::{
    expiration_after, DiscoveryBody, Endpoint, FindNodeBody, NeighborsBody, Node, PingBody,
    PongBody, DISCOVERY_VERSION,
};
use ethspv_protocol::{NodeId, CURRENT_PARAMS, H256};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::unix_now;

/// Nodes per Neighbors reply; keeps the datagram under the size limit.
const MAX_NEIGHBORS: usize = 12;

/// How often timed-out sessions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    node: Node,
    started: Instant,
}

/// Open discovery sessions keyed by node id. Removal is idempotent.
#[derive(Debug, Default)]
pub struct DiscoverySessions {
    inner: Mutex<HashMap<NodeId, SessionEntry>>,
}

impl DiscoverySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session; false if one is already open for the node.
    pub fn add(&self, node: Node, now: Instant) -> bool {
        let mut sessions = self.inner.lock();
        if sessions.contains_key(&node.id) {
            return false;
        }
        sessions.insert(node.id, SessionEntry { node, started: now });
        true
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    pub fn remove_all(&self) -> usize {
        let mut sessions = self.inner.lock();
        let count = sessions.len();
        sessions.clear();
        count
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Close and return sessions open for at least `timeout`.
    pub fn take_expired(&self, now: Instant, timeout: Duration) -> Vec<Node> {
        let mut sessions = self.inner.lock();
        let expired: Vec<Node> = sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.started) >= timeout)
            .map(|s| s.node)
            .collect();
        for node in &expired {
            sessions.remove(&node.id);
        }
        expired
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct Discovery {
    key: Arc<NodeKey>,
    socket: Arc<UdpSocket>,
    local: Endpoint,
    table: Arc<Mutex<NodeTable>>,
    sessions: DiscoverySessions,
    alpha: usize,
    session_timeout: Duration,
}

impl Discovery {
    pub fn new(
        key: Arc<NodeKey>,
        socket: Arc<UdpSocket>,
        local: Endpoint,
        table: Arc<Mutex<NodeTable>>,
    ) -> Self {
        Self {
            key,
            socket,
            local,
            table,
            sessions: DiscoverySessions::new(),
            alpha: CURRENT_PARAMS.discovery_alpha,
            session_timeout: Duration::from_secs(CURRENT_PARAMS.discovery_session_timeout_secs),
        }
    }

    pub fn with_limits(mut self, alpha: usize, session_timeout: Duration) -> Self {
        self.alpha = alpha;
        self.session_timeout = session_timeout;
        self
    }

    pub fn sessions(&self) -> &DiscoverySessions {
        &self.sessions
    }

    fn expiration() -> u64 {
        expiration_after(unix_now(), CURRENT_PARAMS.discovery_expiration_secs)
    }

    async fn send(&self, to: SocketAddr, body: DiscoveryBody) -> anyhow::Result<H256> {
        let (packet, hash) = seal_packet(&self.key, &body)?;
        self.socket.send_to(&packet, to).await?;
        tracing::trace!(%to, kind = body.name(), size = packet.len(), "discovery: sent");
        Ok(hash)
    }

    async fn ping(&self, node: &Node) -> anyhow::Result<H256> {
        let body = DiscoveryBody::Ping(PingBody {
            version: DISCOVERY_VERSION,
            from: self.local,
            to: Endpoint::new(node.endpoint.ip, node.endpoint.udp_port, 0),
            expiration: Self::expiration(),
        });
        self.send(node.endpoint.udp_addr(), body).await
    }

    async fn find_node(&self, to: SocketAddr) -> anyhow::Result<H256> {
        let body = DiscoveryBody::FindNode(FindNodeBody {
            target: self.key.node_id(),
            expiration: Self::expiration(),
        });
        self.send(to, body).await
    }

    /// Query up to `alpha` unqueried nodes. Returns how many sessions opened.
    pub async fn lookup(&self) -> usize {
        let candidates = self.table.lock().take_unused_for_discovery(self.alpha);
        let now = Instant::now();
        let mut opened = 0;
        for node in candidates {
            if !self.sessions.add(node, now) {
                continue;
            }
            let sent = async {
                self.ping(&node).await?;
                self.find_node(node.endpoint.udp_addr()).await
            }
            .await;
            match sent {
                Ok(_) => opened += 1,
                Err(e) => {
                    tracing::debug!(peer = %node.id, "discovery: send failed: {e:#}");
                    self.sessions.remove(&node.id);
                }
            }
        }
        if opened > 0 {
            tracing::debug!(opened, open = self.sessions.len(), "discovery: lookup");
        }
        opened
    }

    /// Verify and act on one datagram.
    pub async fn handle_packet(&self, packet: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        let opened = open_packet(packet, unix_now())?;
        let sender = opened.sender;
        tracing::trace!(%from, peer = %sender, kind = opened.body.name(), "discovery: received");

        match opened.body {
            DiscoveryBody::Ping(ping) => {
                let SocketAddr::V4(v4) = from else {
                    anyhow::bail!("ipv6 sender {from} not supported");
                };
                let endpoint = Endpoint::new(v4.ip().octets(), v4.port(), ping.from.tcp_port);
                let pong = DiscoveryBody::Pong(PongBody {
                    to: endpoint,
                    ping_hash: opened.hash,
                    expiration: Self::expiration(),
                });
                self.send(from, pong).await?;
                self.table.lock().add([Node::new(sender, endpoint)]);
                self.find_node(from).await?;
            }
            DiscoveryBody::Pong(_) => {
                tracing::trace!(peer = %sender, "discovery: pong");
            }
            DiscoveryBody::FindNode(_) => {
                let nodes = self.table.lock().sample(MAX_NEIGHBORS);
                let reply = DiscoveryBody::Neighbors(NeighborsBody {
                    nodes,
                    expiration: Self::expiration(),
                });
                self.send(from, reply).await?;
            }
            DiscoveryBody::Neighbors(neighbors) => {
                let received = neighbors.nodes.len();
                let added = self.table.lock().add(neighbors.nodes);
                self.sessions.remove(&sender);
                tracing::info!(peer = %sender, received, added, "discovery: neighbors");
            }
        }
        Ok(())
    }

    /// Close sessions that never got an answer and forget their nodes.
    pub fn expire_sessions(&self, now: Instant) -> Vec<NodeId> {
        let expired = self.sessions.take_expired(now, self.session_timeout);
        if expired.is_empty() {
            return Vec::new();
        }
        let mut table = self.table.lock();
        let ids: Vec<NodeId> = expired
            .iter()
            .map(|node| {
                table.remove(&node.id);
                node.id
            })
            .collect();
        tracing::debug!(expired = ids.len(), known = table.len(), "discovery: sessions timed out");
        ids
    }
}

/// Discovery loop -- receives datagrams, runs lookups, sweeps sessions.
pub async fn run_discovery_loop(
    discovery: Arc<Discovery>,
    lookup_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    // one spare byte so oversized datagrams are seen as oversized
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
    let mut lookup = tokio::time::interval(lookup_interval);
    lookup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = discovery.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if let Err(e) = discovery.handle_packet(&buf[..len], from).await {
                        tracing::debug!(%from, "discovery: dropped packet: {e:#}");
                    }
                }
                Err(e) => tracing::warn!("discovery: recv failed: {e}"),
            },
            _ = lookup.tick() => {
                discovery.lookup().await;
            }
            _ = sweep.tick() => {
                discovery.expire_sessions(Instant::now());
            }
            _ = shutdown.recv() => {
                let closed = discovery.sessions.remove_all();
                tracing::info!(closed, "shutdown signal, stopping discovery");
                break;
            }
        }
    }
}
