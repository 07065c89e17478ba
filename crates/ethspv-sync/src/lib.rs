//! ethspv Sync -- task engine, header validation and header sync.
//!
//! The [`TaskEngine`] maps logical requests ([`Task`]) onto Ready peers,
//! correlates responses and retries on timeout. The [`HeaderSyncer`] sits on
//! top and drives header-range tasks until the local chain reaches the best
//! head a peer has reported.
//!
//! Both are sans-IO: callers feed peer events and the current time and act
//! on the returned [`EngineEvent`]s.

use ethspv_protocol::messages::{SignedTransaction, Status};
use ethspv_protocol::{BlockHeader, ProtocolError, H256};
use ethspv_storage::StorageError;

pub mod engine;
pub mod proof;
pub mod syncer;
pub mod validator;

pub use engine::{EngineConfig, EngineEvent, PeerHead, TaskEngine, TaskId, TaskOutcome};
pub use proof::ProofError;
pub use syncer::{HeaderSyncer, SyncStep};
pub use validator::{validate_chain, validate_from_anchor, ChainError};

/// A logical request. Owns exactly what is needed to (re)issue it; the peer
/// is chosen per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// LES Status exchange with a newly connected peer. Pinned to that peer.
    Handshake { status: Status },
    /// Headers starting at `from` (inclusive), walking forwards or backwards.
    HeaderRange {
        from: BlockHeader,
        limit: u64,
        reverse: bool,
    },
    /// Account state proven against `header`'s state root.
    AccountState {
        address: [u8; 20],
        header: BlockHeader,
    },
    SendTransaction { transaction: SignedTransaction },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Handshake { .. } => "handshake",
            Task::HeaderRange { .. } => "header_range",
            Task::AccountState { .. } => "account_state",
            Task::SendTransaction { .. } => "send_transaction",
        }
    }

    pub fn header_range(from: BlockHeader, limit: u64, reverse: bool) -> Self {
        Task::HeaderRange {
            from,
            limit,
            reverse,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid chain: {0}")]
    InvalidChain(#[from] ChainError),

    #[error("invalid proof: {0}")]
    InvalidProof(#[from] ProofError),

    #[error("peer has no common ancestor with the stored chain")]
    InvalidForkedPeer,

    #[error("no response within {0}s")]
    Timeout(u64),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("peer speaks les/{0}, expected les/2")]
    InvalidProtocolVersion(u64),

    #[error("peer is on another network (network id {network_id}, genesis {genesis_hash:?})")]
    WrongNetwork { network_id: u64, genesis_hash: H256 },

    #[error("peer head {theirs} is behind ours {ours}")]
    ExpiredBestBlock { ours: u64, theirs: u64 },

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("{message} is not a response to {task}")]
    UnexpectedResponse {
        task: &'static str,
        message: &'static str,
    },

    #[error("{0} task needs a specific peer")]
    Unroutable(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
