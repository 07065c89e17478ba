//! Peer pool -- thread-safe registry of live RLPx sessions.
//!
//! Maps NodeId → PeerHandle. Each handle carries the command channel into
//! its session task; the sync coordinator reaches peers only through here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ethspv_protocol::messages::{DisconnectReason, LesMessage};
use ethspv_protocol::NodeId;
use tokio::sync::{mpsc, RwLock};

use crate::rlpx::PeerCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn name(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Handle to a connected peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Set once the Hello exchange completes.
    pub client_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    commands: mpsc::Sender<PeerCommand>,
}

impl PeerHandle {
    pub fn new(
        node_id: NodeId,
        addr: SocketAddr,
        direction: Direction,
        commands: mpsc::Sender<PeerCommand>,
    ) -> Self {
        Self {
            node_id,
            addr,
            direction,
            client_id: None,
            connected_at: Utc::now(),
            commands,
        }
    }
}

/// Thread-safe pool of active sessions.
#[derive(Clone, Default)]
pub struct PeerPool {
    inner: Arc<RwLock<HashMap<NodeId, PeerHandle>>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns false (and keeps the existing entry) if
    /// the peer is already connected.
    pub async fn insert(&self, handle: PeerHandle) -> bool {
        let node_id = handle.node_id;
        let direction = handle.direction.name();
        let pool_size = {
            let mut pool = self.inner.write().await;
            if pool.contains_key(&node_id) {
                tracing::debug!(%node_id, direction, "pool: already connected");
                return false;
            }
            pool.insert(node_id, handle);
            pool.len()
        };
        tracing::info!(%node_id, direction, pool_size, "pool: peer added");
        true
    }

    /// Remove a peer from the pool.
    pub async fn remove(&self, node_id: &NodeId) -> Option<PeerHandle> {
        let mut pool = self.inner.write().await;
        let removed = pool.remove(node_id);
        if removed.is_some() {
            tracing::info!(%node_id, pool_size = pool.len(), "pool: peer removed");
        }
        removed
    }

    /// Get a clone of a peer handle.
    pub async fn get(&self, node_id: &NodeId) -> Option<PeerHandle> {
        self.inner.read().await.get(node_id).cloned()
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.inner.read().await.contains_key(node_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn set_client(&self, node_id: &NodeId, client_id: String) {
        if let Some(handle) = self.inner.write().await.get_mut(node_id) {
            handle.client_id = Some(client_id);
        }
    }

    async fn command(&self, node_id: &NodeId, command: PeerCommand) -> bool {
        let Some(sender) = self
            .inner
            .read()
            .await
            .get(node_id)
            .map(|h| h.commands.clone())
        else {
            tracing::debug!(%node_id, "pool: no such peer");
            return false;
        };
        if sender.send(command).await.is_err() {
            tracing::debug!(%node_id, "pool: session already gone");
            return false;
        }
        true
    }

    /// Queue a LES message for a peer. False if the peer is gone.
    pub async fn send(&self, node_id: &NodeId, message: LesMessage) -> bool {
        self.command(node_id, PeerCommand::Send(message)).await
    }

    pub async fn disconnect(&self, node_id: &NodeId, reason: DisconnectReason) -> bool {
        self.command(node_id, PeerCommand::Disconnect(reason)).await
    }

    /// Count of (inbound, outbound) sessions.
    pub async fn count_by_direction(&self) -> (usize, usize) {
        let pool = self.inner.read().await;
        let inbound = pool
            .values()
            .filter(|h| h.direction == Direction::Inbound)
            .count();
        (inbound, pool.len() - inbound)
    }
}
