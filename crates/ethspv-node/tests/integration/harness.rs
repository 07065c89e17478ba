//! Test harness for in-process ethspv-node integration tests.
//!
//! Provides TestNode (one swarm listening on loopback TCP) and
//! TestNodeBuilder (config). Nodes run real RLPx sessions against each
//! other inside the test's tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use ethspv_crypto::NodeKey;
use ethspv_node::peer_pool::PeerPool;
use ethspv_node::swarm_task::{self, Swarm};
use ethspv_node::sync_task::{self, SyncCommand, SyncCoordinator};
use ethspv_node::NodeEvent;
use ethspv_peer::{LocalHello, NodeTable};
use ethspv_protocol::discovery::{Endpoint, Node};
use ethspv_protocol::{BlockHeader, H256};
use ethspv_storage::Storage;
use ethspv_sync::{EngineConfig, HeaderSyncer};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

pub const NETWORK_ID: u64 = 1;
pub const GENESIS: H256 = H256([0xd4; 32]);

/// A running in-process node: listener plus swarm, and optionally the sync
/// coordinator.
pub struct TestNode {
    pub node: Node,
    pub swarm: Swarm,
    pub pool: PeerPool,
    pub table: Arc<Mutex<NodeTable>>,
    events: Option<mpsc::Receiver<NodeEvent>>,
    shutdown_tx: broadcast::Sender<()>,
    _handles: Vec<tokio::task::JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestNode {
    pub fn id(&self) -> ethspv_protocol::NodeId {
        self.node.id
    }

    pub async fn dial(&self, other: &TestNode) -> anyhow::Result<()> {
        self.swarm.dial(other.node).await
    }

    /// Session events, for tests that play the remote side by hand.
    pub fn take_events(&mut self) -> mpsc::Receiver<NodeEvent> {
        self.events.take().expect("events already taken")
    }

    /// Next session event, or an error after `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> anyhow::Result<NodeEvent> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("events already taken"))?;
        tokio::time::timeout(timeout, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timeout waiting for node event"))?
            .ok_or_else(|| anyhow::anyhow!("event channel closed"))
    }

    /// Hand the event stream to a sync coordinator.
    pub fn start_sync(
        &mut self,
        storage: Arc<dyn Storage>,
        checkpoint: BlockHeader,
        headers_limit: u64,
    ) -> mpsc::Sender<SyncCommand> {
        let events = self.take_events();
        let syncer = HeaderSyncer::new(storage.clone(), checkpoint, headers_limit);
        let coordinator = SyncCoordinator::new(
            EngineConfig::new(NETWORK_ID, GENESIS),
            syncer,
            storage,
            self.pool.clone(),
        );
        let (command_tx, command_rx) = mpsc::channel(16);
        let shutdown = self.shutdown_tx.subscribe();
        self._handles.push(tokio::spawn(async move {
            sync_task::run_sync_loop(coordinator, events, command_rx, shutdown).await;
        }));
        command_tx
    }

    /// Poll the pool until it holds `n` sessions, or timeout.
    pub async fn wait_peers(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let have = self.pool.len().await;
            if have == n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {n} peers (have {have})");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Builder for TestNode with sensible test defaults.
pub struct TestNodeBuilder {
    seed: u64,
    max_peers: usize,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed, max_peers: 5 }
    }

    pub fn max_peers(mut self, n: usize) -> Self {
        self.max_peers = n;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let key = Arc::new(NodeKey::generate(&mut StdRng::seed_from_u64(self.seed)));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let node = Node::new(key.node_id(), Endpoint::new([127, 0, 0, 1], port, port));

        let table = Arc::new(Mutex::new(NodeTable::new(key.node_id())));
        let pool = PeerPool::new();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);
        let hello = LocalHello::light_client(key.node_id(), format!("ethspv/test-{}", self.seed), port);
        let swarm = Swarm::new(
            key,
            hello,
            pool.clone(),
            table.clone(),
            event_tx,
            shutdown_tx.clone(),
            self.max_peers,
        );

        let listener_handle = {
            let swarm = swarm.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                swarm_task::run_listener(swarm, listener, shutdown).await;
            })
        };

        Ok(TestNode {
            node,
            swarm,
            pool,
            table,
            events: Some(event_rx),
            shutdown_tx,
            _handles: vec![listener_handle],
        })
    }
}
