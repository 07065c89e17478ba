//! Sync coordinator task -- the single owner of the task engine and the
//! header syncer.
//!
//! Sessions report lifecycle changes and decoded LES messages as
//! [`NodeEvent`]s; the coordinator feeds them to the engine, routes the
//! engine's outbound messages through the [`PeerPool`] and turns completed
//! header windows into the next sync request.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethspv_protocol::messages::{DisconnectReason, SignedTransaction, Status};
use ethspv_protocol::{NodeId, H256};
use ethspv_storage::{ChainStorage, Storage};
use ethspv_sync::{
    EngineConfig, EngineEvent, HeaderSyncer, SyncError, SyncStep, Task, TaskEngine, TaskOutcome,
};
use tokio::sync::{broadcast, mpsc};

use crate::peer_pool::PeerPool;
use crate::NodeEvent;

/// Engine timers are checked this often.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Requests from outside the sync loop.
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Fetch and prove an account against the current head.
    AccountState { address: [u8; 20] },
    SendTransaction(SignedTransaction),
}

fn disconnect_reason(error: &SyncError) -> DisconnectReason {
    match error {
        SyncError::Timeout(_) => DisconnectReason::Timeout,
        SyncError::InvalidProtocolVersion(_) => DisconnectReason::IncompatibleVersion,
        SyncError::WrongNetwork { .. }
        | SyncError::ExpiredBestBlock { .. }
        | SyncError::InvalidForkedPeer => DisconnectReason::UselessPeer,
        _ => DisconnectReason::SubprotocolError,
    }
}

pub struct SyncCoordinator {
    engine: TaskEngine,
    syncer: HeaderSyncer,
    storage: Arc<dyn Storage>,
    pool: PeerPool,
    protocol_version: u64,
    network_id: u64,
    genesis_hash: H256,
}

impl SyncCoordinator {
    pub fn new(
        config: EngineConfig,
        syncer: HeaderSyncer,
        storage: Arc<dyn Storage>,
        pool: PeerPool,
    ) -> Self {
        Self {
            protocol_version: config.protocol_version,
            network_id: config.network_id,
            genesis_hash: config.genesis_hash,
            engine: TaskEngine::new(config),
            syncer,
            storage,
            pool,
        }
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn syncer(&self) -> &HeaderSyncer {
        &self.syncer
    }

    fn local_status(&self) -> Result<Status, SyncError> {
        let head = self.syncer.last_header()?;
        Ok(Status::light(
            self.protocol_version,
            self.network_id,
            self.genesis_hash,
            &head,
        ))
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    pub async fn on_node_event(&mut self, event: NodeEvent, now: Instant) {
        let events = match event {
            NodeEvent::PeerReady { peer, client_id } => {
                self.pool.set_client(&peer, client_id).await;
                match self.local_status() {
                    Ok(status) => self.engine.add_peer(peer, status, now),
                    Err(e) => {
                        tracing::error!(%peer, "sync: cannot build status: {e}");
                        Vec::new()
                    }
                }
            }
            NodeEvent::PeerMessage { peer, message } => self.engine.on_message(peer, message, now),
            NodeEvent::PeerClosed { peer, reason } => {
                tracing::debug!(%peer, ?reason, "sync: peer gone");
                self.engine.remove_peer(&peer, now)
            }
        };
        self.apply(events, now).await;
    }

    pub async fn on_command(&mut self, command: SyncCommand, now: Instant) {
        let task = match command {
            SyncCommand::AccountState { address } => {
                let header = match self.syncer.last_header() {
                    Ok(header) => header,
                    Err(e) => {
                        tracing::warn!("sync: no head for account request: {e}");
                        return;
                    }
                };
                if header.state_root.is_zero() {
                    tracing::warn!(head = header.number, "sync: head has no state root yet");
                    return;
                }
                Task::AccountState { address, header }
            }
            SyncCommand::SendTransaction(transaction) => {
                if let Err(e) = self.storage.save_transaction(&transaction) {
                    tracing::warn!("sync: cannot store transaction: {e}");
                }
                Task::SendTransaction { transaction }
            }
        };
        let (task_id, events) = self.engine.submit(task, now);
        tracing::debug!(task_id, "sync: task submitted");
        self.apply(events, now).await;
    }

    /// Expire timers and restart sync if a peer is ahead and nothing runs.
    pub async fn tick(&mut self, now: Instant) {
        let mut events = self.engine.tick(now);
        if !self.syncer.is_syncing() {
            if let Some(head) = self.engine.best_peer().map(|(_, head)| head.clone()) {
                events.extend(self.on_head(head.hash, head.number, now));
            }
        }
        self.apply(events, now).await;
    }

    // ========================================================================
    // Engine events
    // ========================================================================

    async fn apply(&mut self, events: Vec<EngineEvent>, now: Instant) {
        let mut queue: VecDeque<EngineEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            let follow_up = self.handle(event, now).await;
            queue.extend(follow_up);
        }
    }

    async fn handle(&mut self, event: EngineEvent, now: Instant) -> Vec<EngineEvent> {
        match event {
            EngineEvent::Send { peer, message } => {
                if self.pool.send(&peer, message).await {
                    Vec::new()
                } else {
                    self.engine.remove_peer(&peer, now)
                }
            }
            EngineEvent::PeerReady { peer, head } => {
                tracing::info!(%peer, head = head.number, "sync: peer handshake done");
                self.on_head(head.hash, head.number, now)
            }
            EngineEvent::Announced { peer, announce } => {
                tracing::debug!(%peer, head = announce.head_number, "sync: announce");
                self.on_head(announce.head_hash, announce.head_number, now)
            }
            EngineEvent::Completed {
                task_id,
                peer,
                outcome,
            } => {
                tracing::debug!(%peer, task_id, "sync: task done");
                self.on_outcome(peer, outcome, now).await
            }
            EngineEvent::Failed {
                task_id,
                task,
                error,
            } => {
                tracing::warn!(task_id, task = task.name(), %error, "sync: task failed");
                if let Task::HeaderRange { .. } = task {
                    self.syncer.on_task_failed();
                }
                Vec::new()
            }
            EngineEvent::DisconnectPeer { peer, error } => self.drop_peer(peer, &error, now).await,
        }
    }

    async fn drop_peer(&mut self, peer: NodeId, error: &SyncError, now: Instant) -> Vec<EngineEvent> {
        let reason = disconnect_reason(error);
        tracing::info!(%peer, ?reason, %error, "sync: dropping peer");
        self.pool.disconnect(&peer, reason).await;
        self.engine.remove_peer(&peer, now)
    }

    fn on_head(&mut self, hash: H256, number: u64, now: Instant) -> Vec<EngineEvent> {
        match self.syncer.on_peer_head(hash, number) {
            Ok(Some(task)) => self.engine.submit(task, now).1,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("sync: cannot start: {e}");
                Vec::new()
            }
        }
    }

    async fn on_outcome(
        &mut self,
        peer: NodeId,
        outcome: TaskOutcome,
        now: Instant,
    ) -> Vec<EngineEvent> {
        match outcome {
            TaskOutcome::Headers {
                from,
                headers,
                reverse,
            } => match self.syncer.on_headers(&from, headers, reverse) {
                Ok(SyncStep::Request(task)) => self.engine.submit(task, now).1,
                Ok(SyncStep::Synced(head)) => {
                    tracing::info!(head = head.number, hash = %head.hash_hex(), "sync: synced");
                    Vec::new()
                }
                Err(error @ SyncError::InvalidForkedPeer) => self.drop_peer(peer, &error, now).await,
                Err(e) => {
                    tracing::warn!(%peer, "sync: batch rejected: {e}");
                    Vec::new()
                }
            },
            TaskOutcome::Account(state) => {
                tracing::info!(
                    address = %hex::encode(state.address),
                    nonce = state.nonce,
                    balance = %state.balance,
                    "sync: account state proven"
                );
                if let Err(e) = self.storage.save_account_state(&state) {
                    tracing::warn!("sync: cannot store account state: {e}");
                }
                Vec::new()
            }
            TaskOutcome::TransactionStatus { hash, status } => {
                tracing::info!(tx = %hex::encode(hash.as_bytes()), ?status, "sync: transaction status");
                Vec::new()
            }
        }
    }
}

/// Run the sync loop until shutdown.
pub async fn run_sync_loop(
    mut coordinator: SyncCoordinator,
    mut events: mpsc::Receiver<NodeEvent>,
    mut commands: mpsc::Receiver<SyncCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                coordinator.on_node_event(event, Instant::now()).await;
            }
            Some(command) = commands.recv() => {
                coordinator.on_command(command, Instant::now()).await;
            }
            _ = ticker.tick() => {
                coordinator.tick(Instant::now()).await;
            }
            _ = shutdown.recv() => {
                tracing::info!(
                    ready = coordinator.engine.ready_peers(),
                    queued = coordinator.engine.queued(),
                    "shutdown signal, stopping sync"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethspv_protocol::messages::{
        BlockHeaders, BlockOrigin, LesMessage, RawTransaction, TransactionSignature,
    };
    use ethspv_protocol::{BlockHeader, U256};
    use ethspv_storage::MemoryStorage;

    use crate::peer_pool::{Direction, PeerHandle};
    use crate::rlpx::PeerCommand;

    const GENESIS: H256 = H256([0xd4; 32]);

    fn make_node_id(byte: u8) -> NodeId {
        NodeId([byte; 64])
    }

    fn header(number: u64, parent: H256) -> BlockHeader {
        BlockHeader {
            parent_hash: parent,
            number,
            difficulty: U256::from(10u64),
            ..Default::default()
        }
        .with_computed_hash()
    }

    fn checkpoint() -> BlockHeader {
        let mut h = header(100, H256::repeat_byte(0xaa));
        h.total_difficulty = U256::from(1000u64);
        h
    }

    struct Fixture {
        coordinator: SyncCoordinator,
        storage: Arc<MemoryStorage>,
        peer_rx: mpsc::Receiver<PeerCommand>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let pool = PeerPool::new();
        let (tx, peer_rx) = mpsc::channel(16);
        let addr = "127.0.0.1:30303".parse().unwrap();
        pool.insert(PeerHandle::new(make_node_id(1), addr, Direction::Outbound, tx))
            .await;
        let syncer = HeaderSyncer::new(storage.clone(), checkpoint(), 3);
        let coordinator =
            SyncCoordinator::new(EngineConfig::new(1, GENESIS), syncer, storage.clone(), pool);
        Fixture {
            coordinator,
            storage,
            peer_rx,
        }
    }

    async fn sent(rx: &mut mpsc::Receiver<PeerCommand>) -> PeerCommand {
        rx.try_recv().expect("command queued")
    }

    fn remote_status(network_id: u64, head_number: u64) -> LesMessage {
        let mut head = header(head_number, H256::zero());
        head.total_difficulty = U256::from(5000u64);
        status_at(network_id, &head)
    }

    fn status_at(network_id: u64, head: &BlockHeader) -> LesMessage {
        LesMessage::Status(Status::light(2, network_id, GENESIS, head))
    }

    async fn ready_peer(f: &mut Fixture) {
        let now = Instant::now();
        f.coordinator
            .on_node_event(
                NodeEvent::PeerReady {
                    peer: make_node_id(1),
                    client_id: "geth/test".into(),
                },
                now,
            )
            .await;
        match sent(&mut f.peer_rx).await {
            PeerCommand::Send(LesMessage::Status(status)) => {
                assert_eq!(status.head_number, 100);
                assert_eq!(status.genesis_hash, GENESIS);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_then_sync_to_head() {
        let mut f = fixture().await;
        ready_peer(&mut f).await;

        let now = Instant::now();
        f.coordinator
            .on_node_event(
                NodeEvent::PeerMessage {
                    peer: make_node_id(1),
                    message: remote_status(1, 102),
                },
                now,
            )
            .await;
        assert!(f.coordinator.syncer().is_syncing());

        let request_id = match sent(&mut f.peer_rx).await {
            PeerCommand::Send(LesMessage::GetBlockHeaders(req)) => {
                assert_eq!(req.origin, BlockOrigin::Hash(checkpoint().hash));
                assert_eq!(req.max_headers, 3);
                assert!(!req.reverse);
                req.request_id
            }
            other => panic!("unexpected {other:?}"),
        };

        let cp = checkpoint();
        let h101 = header(101, cp.hash);
        let reply = LesMessage::BlockHeaders(BlockHeaders {
            request_id,
            buffer_value: 0,
            headers: vec![cp, h101.clone()],
        });
        f.coordinator
            .on_node_event(
                NodeEvent::PeerMessage {
                    peer: make_node_id(1),
                    message: reply,
                },
                now,
            )
            .await;

        assert!(!f.coordinator.syncer().is_syncing());
        let stored = f.storage.last_header().unwrap().unwrap();
        assert_eq!(stored.hash, h101.hash);
        assert_eq!(stored.total_difficulty, U256::from(1010u64));
    }

    #[tokio::test]
    async fn test_wrong_network_disconnects() {
        let mut f = fixture().await;
        ready_peer(&mut f).await;

        f.coordinator
            .on_node_event(
                NodeEvent::PeerMessage {
                    peer: make_node_id(1),
                    message: remote_status(3, 150),
                },
                Instant::now(),
            )
            .await;
        assert!(matches!(
            sent(&mut f.peer_rx).await,
            PeerCommand::Disconnect(DisconnectReason::UselessPeer)
        ));
        assert_eq!(f.coordinator.engine().ready_peers(), 0);
    }

    #[tokio::test]
    async fn test_send_transaction_is_stored_and_sent() {
        let mut f = fixture().await;
        ready_peer(&mut f).await;
        f.coordinator
            .on_node_event(
                NodeEvent::PeerMessage {
                    peer: make_node_id(1),
                    message: status_at(1, &checkpoint()),
                },
                Instant::now(),
            )
            .await;
        // same head as ours: no sync, peer stays idle
        assert!(f.peer_rx.try_recv().is_err());

        let tx = SignedTransaction {
            raw: RawTransaction {
                nonce: 1,
                gas_price: U256::from(20u64),
                gas_limit: 21_000,
                to: vec![0x11; 20],
                value: U256::from(1u64),
                data: Vec::new(),
            },
            signature: TransactionSignature {
                v: 27,
                r: U256::from(3u64),
                s: U256::from(4u64),
            },
        };
        f.coordinator
            .on_command(SyncCommand::SendTransaction(tx.clone()), Instant::now())
            .await;

        assert_eq!(f.storage.transactions().unwrap(), vec![tx.clone()]);
        match sent(&mut f.peer_rx).await {
            PeerCommand::Send(LesMessage::SendTx(send)) => assert_eq!(send.transactions, vec![tx]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_account_request_needs_state_root() {
        let mut f = fixture().await;
        f.coordinator
            .on_command(SyncCommand::AccountState { address: [1; 20] }, Instant::now())
            .await;
        assert_eq!(f.coordinator.engine().queued(), 0);
    }

    #[tokio::test]
    async fn test_closed_peer_is_forgotten() {
        let mut f = fixture().await;
        ready_peer(&mut f).await;
        f.coordinator
            .on_node_event(
                NodeEvent::PeerClosed {
                    peer: make_node_id(1),
                    reason: DisconnectReason::TcpError,
                },
                Instant::now(),
            )
            .await;
        // a status arriving late is ignored
        f.coordinator
            .on_node_event(
                NodeEvent::PeerMessage {
                    peer: make_node_id(1),
                    message: remote_status(1, 150),
                },
                Instant::now(),
            )
            .await;
        assert_eq!(f.coordinator.engine().ready_peers(), 0);
        assert!(!f.coordinator.syncer().is_syncing());
    }

    #[test]
    fn test_disconnect_reasons() {
        assert_eq!(disconnect_reason(&SyncError::Timeout(10)), DisconnectReason::Timeout);
        assert_eq!(
            disconnect_reason(&SyncError::InvalidProtocolVersion(1)),
            DisconnectReason::IncompatibleVersion
        );
        assert_eq!(
            disconnect_reason(&SyncError::InvalidForkedPeer),
            DisconnectReason::UselessPeer
        );
        assert_eq!(
            disconnect_reason(&SyncError::PeerDisconnected),
            DisconnectReason::SubprotocolError
        );
    }
}
