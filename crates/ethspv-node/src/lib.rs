//! ethspv Node -- library crate for the light client runtime.
//!
//! Re-exports all internal modules so integration tests and the binary can
//! reach the session driver, discovery, swarm, sync coordinator, config and
//! peer pool types.

pub mod config;
pub mod discovery_task;
pub mod peer_pool;
pub mod rlpx;
pub mod swarm_task;
pub mod sync_task;

use std::path::PathBuf;

use ethspv_protocol::messages::{DisconnectReason, LesMessage};
use ethspv_protocol::NodeId;

/// What sessions report to the sync coordinator.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Hello exchange finished; LES handshake can start.
    PeerReady { peer: NodeId, client_id: String },
    PeerMessage { peer: NodeId, message: LesMessage },
    PeerClosed {
        peer: NodeId,
        reason: DisconnectReason,
    },
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Current Unix time in seconds, as discovery expirations use.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
