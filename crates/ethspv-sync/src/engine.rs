//! Task engine -- routes tasks to Ready peers and correlates responses.
//!
//! The engine is a single-owner state machine: the sync coordinator task
//! owns it and feeds it peer lifecycle changes, decoded LES messages and
//! timer ticks. Every entry point returns the [`EngineEvent`]s the caller
//! must act on.
//!
//! Requests carrying a request id are correlated by that id. The LES Status
//! exchange has none, so handshakes are keyed by peer.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use ethspv_protocol::messages::{
    Announce, BlockOrigin, GetBlockHeaders, GetProofs, LesMessage, ProofRequest, SendTx, Status,
    TxStatusKind,
};
use ethspv_protocol::{AccountState, BlockHeader, NodeId, CURRENT_PARAMS, H256, U256};

use crate::proof::verify_account_proof;
use crate::validator::{validate_chain, ChainError};
use crate::{SyncError, Task};

/// Caller-facing handle for a submitted task.
pub type TaskId = u64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub protocol_version: u64,
    pub network_id: u64,
    pub genesis_hash: H256,
}

impl EngineConfig {
    pub fn new(network_id: u64, genesis_hash: H256) -> Self {
        Self {
            request_timeout: Duration::from_secs(CURRENT_PARAMS.request_timeout_secs),
            max_attempts: CURRENT_PARAMS.max_task_attempts,
            protocol_version: 2,
            network_id,
            genesis_hash,
        }
    }
}

/// Best block a peer has told us about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHead {
    pub hash: H256,
    pub number: u64,
    pub total_difficulty: U256,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Headers {
        from: BlockHeader,
        headers: Vec<BlockHeader>,
        reverse: bool,
    },
    Account(AccountState),
    TransactionStatus { hash: H256, status: TxStatusKind },
}

#[derive(Debug)]
pub enum EngineEvent {
    /// Deliver a message to a peer.
    Send { peer: NodeId, message: LesMessage },
    /// Handshake succeeded; the peer now takes tasks.
    PeerReady { peer: NodeId, head: PeerHead },
    Completed {
        task_id: TaskId,
        peer: NodeId,
        outcome: TaskOutcome,
    },
    /// Retry bound reached or the task cannot be routed.
    Failed {
        task_id: TaskId,
        task: Task,
        error: SyncError,
    },
    Announced { peer: NodeId, announce: Announce },
    /// The peer is unusable; the caller should drop the connection.
    DisconnectPeer { peer: NodeId, error: SyncError },
}

enum PeerSlot {
    Handshaking {
        task_id: TaskId,
        local_head: u64,
        deadline: Instant,
    },
    Ready {
        head: PeerHead,
        busy: bool,
    },
}

impl PeerSlot {
    fn is_idle(&self) -> bool {
        matches!(self, PeerSlot::Ready { busy: false, .. })
    }

    fn set_busy(&mut self, value: bool) {
        if let PeerSlot::Ready { busy, .. } = self {
            *busy = value;
        }
    }
}

#[derive(Debug)]
struct QueuedTask {
    id: TaskId,
    task: Task,
    attempts: u32,
    tried: Vec<NodeId>,
}

struct PendingRequest {
    queued: QueuedTask,
    peer: NodeId,
    deadline: Instant,
}

pub struct TaskEngine {
    config: EngineConfig,
    peers: HashMap<NodeId, PeerSlot>,
    queue: VecDeque<QueuedTask>,
    pending: HashMap<u64, PendingRequest>,
    next_task_id: TaskId,
    next_request_id: u64,
}

impl TaskEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            next_task_id: 1,
            next_request_id: 1,
        }
    }

    fn allocate_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    // ========================================================================
    // Peer lifecycle
    // ========================================================================

    /// A connection reached Ready: start the LES handshake on it.
    pub fn add_peer(&mut self, peer: NodeId, local: Status, now: Instant) -> Vec<EngineEvent> {
        if self.peers.contains_key(&peer) {
            tracing::debug!(%peer, "engine: peer already known");
            return Vec::new();
        }
        let task_id = self.allocate_task_id();
        self.peers.insert(
            peer,
            PeerSlot::Handshaking {
                task_id,
                local_head: local.head_number,
                deadline: now + self.config.request_timeout,
            },
        );
        tracing::debug!(%peer, task_id, "engine: handshake started");
        vec![EngineEvent::Send {
            peer,
            message: LesMessage::Status(local),
        }]
    }

    /// Forget a peer. Its in-flight tasks go back to the queue.
    pub fn remove_peer(&mut self, peer: &NodeId, now: Instant) -> Vec<EngineEvent> {
        if self.peers.remove(peer).is_none() {
            return Vec::new();
        }
        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer == *peer)
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::new();
        for request_id in orphaned {
            if let Some(pending) = self.pending.remove(&request_id) {
                tracing::debug!(%peer, task_id = pending.queued.id, "engine: releasing task");
                self.retry(pending.queued, SyncError::PeerDisconnected, &mut events);
            }
        }
        self.dispatch(now, &mut events);
        events
    }

    fn on_status(&mut self, peer: NodeId, status: Status, now: Instant) -> Vec<EngineEvent> {
        let Some(PeerSlot::Handshaking {
            task_id,
            local_head,
            ..
        }) = self.peers.get(&peer)
        else {
            tracing::debug!(%peer, "engine: unsolicited status");
            return Vec::new();
        };
        let (task_id, local_head) = (*task_id, *local_head);

        if let Err(error) = self.check_status(&status, local_head) {
            tracing::info!(%peer, task_id, %error, "engine: handshake rejected");
            self.peers.remove(&peer);
            return vec![EngineEvent::DisconnectPeer { peer, error }];
        }

        let head = PeerHead {
            hash: status.head_hash,
            number: status.head_number,
            total_difficulty: status.head_td,
        };
        tracing::info!(%peer, head = head.number, "engine: peer ready");
        self.peers.insert(
            peer,
            PeerSlot::Ready {
                head: head.clone(),
                busy: false,
            },
        );
        let mut events = vec![EngineEvent::PeerReady { peer, head }];
        self.dispatch(now, &mut events);
        events
    }

    fn check_status(&self, status: &Status, local_head: u64) -> Result<(), SyncError> {
        if status.protocol_version != self.config.protocol_version {
            return Err(SyncError::InvalidProtocolVersion(status.protocol_version));
        }
        if status.network_id != self.config.network_id
            || status.genesis_hash != self.config.genesis_hash
        {
            return Err(SyncError::WrongNetwork {
                network_id: status.network_id,
                genesis_hash: status.genesis_hash,
            });
        }
        if status.head_number < local_head {
            return Err(SyncError::ExpiredBestBlock {
                ours: local_head,
                theirs: status.head_number,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Queue a task and dispatch whatever can go out now.
    pub fn submit(&mut self, task: Task, now: Instant) -> (TaskId, Vec<EngineEvent>) {
        let id = self.allocate_task_id();
        let mut events = Vec::new();
        if let Task::Handshake { .. } = task {
            // handshakes are bound to a connection; see add_peer
            events.push(EngineEvent::Failed {
                task_id: id,
                task,
                error: SyncError::Unroutable("handshake"),
            });
            return (id, events);
        }
        tracing::debug!(task_id = id, task = task.name(), "engine: task queued");
        self.queue.push_back(QueuedTask {
            id,
            task,
            attempts: 0,
            tried: Vec::new(),
        });
        self.dispatch(now, &mut events);
        (id, events)
    }

    /// Idle Ready peer for the next attempt, preferring ones not yet tried.
    fn pick_peer(&self, tried: &[NodeId]) -> Option<NodeId> {
        let idle = || {
            self.peers
                .iter()
                .filter(|(_, slot)| slot.is_idle())
                .map(|(id, _)| *id)
        };
        idle()
            .filter(|id| !tried.contains(id))
            .min()
            .or_else(|| idle().min())
    }

    fn dispatch(&mut self, now: Instant, events: &mut Vec<EngineEvent>) {
        let mut waiting = VecDeque::new();
        while let Some(queued) = self.queue.pop_front() {
            match self.pick_peer(&queued.tried) {
                Some(peer) => events.push(self.start(queued, peer, now)),
                None => waiting.push_back(queued),
            }
        }
        self.queue = waiting;
    }

    fn start(&mut self, mut queued: QueuedTask, peer: NodeId, now: Instant) -> EngineEvent {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let message = match &queued.task {
            Task::HeaderRange {
                from,
                limit,
                reverse,
            } => LesMessage::GetBlockHeaders(GetBlockHeaders {
                request_id,
                origin: BlockOrigin::Hash(from.hash),
                max_headers: *limit,
                skip: 0,
                reverse: *reverse,
            }),
            Task::AccountState { address, header } => LesMessage::GetProofs(GetProofs {
                request_id,
                requests: vec![ProofRequest::account(header.hash, address)],
            }),
            Task::SendTransaction { transaction } => LesMessage::SendTx(SendTx {
                request_id,
                transactions: vec![transaction.clone()],
            }),
            Task::Handshake { status } => LesMessage::Status(status.clone()),
        };

        queued.attempts += 1;
        if !queued.tried.contains(&peer) {
            queued.tried.push(peer);
        }
        if let Some(slot) = self.peers.get_mut(&peer) {
            slot.set_busy(true);
        }
        tracing::debug!(
            %peer,
            task_id = queued.id,
            request_id,
            attempt = queued.attempts,
            task = queued.task.name(),
            "engine: request sent"
        );
        self.pending.insert(
            request_id,
            PendingRequest {
                queued,
                peer,
                deadline: now + self.config.request_timeout,
            },
        );
        EngineEvent::Send { peer, message }
    }

    /// Put a failed attempt back in line, or give up.
    fn retry(&mut self, queued: QueuedTask, error: SyncError, events: &mut Vec<EngineEvent>) {
        if queued.attempts >= self.config.max_attempts {
            tracing::warn!(
                task_id = queued.id,
                attempts = queued.attempts,
                %error,
                "engine: task failed"
            );
            events.push(EngineEvent::Failed {
                task_id: queued.id,
                error: SyncError::Exhausted {
                    attempts: queued.attempts,
                    last: error.to_string(),
                },
                task: queued.task,
            });
            return;
        }
        tracing::debug!(task_id = queued.id, %error, "engine: task requeued");
        self.queue.push_front(queued);
    }

    /// Claim the pending entry for a response. Responses from a peer other
    /// than the one asked are ignored.
    fn take_pending(&mut self, request_id: u64, peer: &NodeId) -> Option<PendingRequest> {
        match self.pending.get(&request_id) {
            Some(pending) if pending.peer == *peer => {}
            Some(_) => {
                tracing::debug!(%peer, request_id, "engine: response from wrong peer");
                return None;
            }
            None => {
                tracing::debug!(%peer, request_id, "engine: stale response");
                return None;
            }
        }
        let pending = self.pending.remove(&request_id)?;
        if let Some(slot) = self.peers.get_mut(peer) {
            slot.set_busy(false);
        }
        Some(pending)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub fn on_message(&mut self, peer: NodeId, message: LesMessage, now: Instant) -> Vec<EngineEvent> {
        let request_id = message.request_id();
        match message {
            LesMessage::Status(status) => return self.on_status(peer, status, now),
            LesMessage::Announce(announce) => return self.on_announce(peer, announce),
            LesMessage::BlockHeaders(_) | LesMessage::Proofs(_) | LesMessage::TxStatus(_) => {}
            other => {
                tracing::trace!(%peer, message = other.name(), "engine: ignoring request");
                return Vec::new();
            }
        }

        let Some(pending) = request_id.and_then(|id| self.take_pending(id, &peer)) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let task_id = pending.queued.id;
        match Self::complete(&pending.queued.task, message) {
            Ok(outcome) => {
                tracing::debug!(%peer, task_id, "engine: task completed");
                events.push(EngineEvent::Completed {
                    task_id,
                    peer,
                    outcome,
                });
            }
            Err(error) => {
                tracing::info!(%peer, task_id, %error, "engine: bad response");
                self.retry(pending.queued, error, &mut events);
            }
        }
        self.dispatch(now, &mut events);
        events
    }

    fn complete(task: &Task, message: LesMessage) -> Result<TaskOutcome, SyncError> {
        match (task, message) {
            (
                Task::HeaderRange {
                    from,
                    limit,
                    reverse,
                },
                LesMessage::BlockHeaders(batch),
            ) => {
                if batch.headers.len() as u64 > *limit {
                    return Err(ChainError::Oversized {
                        limit: *limit,
                        got: batch.headers.len(),
                    }
                    .into());
                }
                validate_chain(&batch.headers, *reverse)?;
                Ok(TaskOutcome::Headers {
                    from: from.clone(),
                    headers: batch.headers,
                    reverse: *reverse,
                })
            }
            (Task::AccountState { address, header }, LesMessage::Proofs(proofs)) => {
                let state = verify_account_proof(address, &header.state_root, &proofs.nodes)?;
                Ok(TaskOutcome::Account(state))
            }
            (Task::SendTransaction { transaction }, LesMessage::TxStatus(reply)) => {
                Ok(TaskOutcome::TransactionStatus {
                    hash: transaction.hash(),
                    status: reply
                        .statuses
                        .into_iter()
                        .next()
                        .unwrap_or(TxStatusKind::Unknown),
                })
            }
            (task, message) => Err(SyncError::UnexpectedResponse {
                task: task.name(),
                message: message.name(),
            }),
        }
    }

    fn on_announce(&mut self, peer: NodeId, announce: Announce) -> Vec<EngineEvent> {
        let Some(PeerSlot::Ready { head, .. }) = self.peers.get_mut(&peer) else {
            return Vec::new();
        };
        if announce.head_number >= head.number {
            *head = PeerHead {
                hash: announce.head_hash,
                number: announce.head_number,
                total_difficulty: announce.head_td,
            };
        }
        tracing::debug!(%peer, head = announce.head_number, "engine: announce");
        vec![EngineEvent::Announced { peer, announce }]
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Expire handshakes and requests whose deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Vec<EngineEvent> {
        let timeout_secs = self.config.request_timeout.as_secs();
        let mut events = Vec::new();

        let stalled: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, slot)| matches!(slot, PeerSlot::Handshaking { deadline, .. } if *deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for peer in stalled {
            tracing::info!(%peer, "engine: handshake timed out");
            self.peers.remove(&peer);
            events.push(EngineEvent::DisconnectPeer {
                peer,
                error: SyncError::Timeout(timeout_secs),
            });
        }

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            if let Some(pending) = self.pending.remove(&request_id) {
                let peer = pending.peer;
                tracing::info!(%peer, request_id, "engine: request timed out");
                // a silent peer is treated as gone; its slot is not reused
                if self.peers.remove(&peer).is_some() {
                    events.push(EngineEvent::DisconnectPeer {
                        peer,
                        error: SyncError::Timeout(timeout_secs),
                    });
                }
                self.retry(pending.queued, SyncError::Timeout(timeout_secs), &mut events);
            }
        }

        self.dispatch(now, &mut events);
        events
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn ready_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|slot| matches!(slot, PeerSlot::Ready { .. }))
            .count()
    }

    pub fn peer_head(&self, peer: &NodeId) -> Option<&PeerHead> {
        match self.peers.get(peer) {
            Some(PeerSlot::Ready { head, .. }) => Some(head),
            _ => None,
        }
    }

    /// Ready peer with the highest reported head.
    pub fn best_peer(&self) -> Option<(NodeId, &PeerHead)> {
        self.peers
            .iter()
            .filter_map(|(id, slot)| match slot {
                PeerSlot::Ready { head, .. } => Some((*id, head)),
                _ => None,
            })
            .max_by_key(|(id, head)| (head.total_difficulty, head.number, std::cmp::Reverse(*id)))
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
