//! Peer-level protocol logic: capability negotiation, the per-connection
//! state machine and the scored node table.
//!
//! Everything here is sans-IO. The node crate owns sockets and timers and
//! drives these types with decoded frames.

pub mod connection;
pub mod negotiation;
pub mod node_table;

pub use connection::{ConnectionState, LocalHello, PeerConnection, PeerEvent};
pub use negotiation::{agreed_capabilities, shared_capabilities, MessageIdMap};
pub use node_table::NodeTable;

use ethspv_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected message {code:#x} while {state}")]
    UnexpectedMessage { code: u64, state: &'static str },

    #[error("{operation} not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("connection closed")]
    Closed,
}

impl PeerError {
    /// Errors caused by the remote breaking protocol, as opposed to local
    /// misuse of the connection.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            PeerError::Protocol(_) | PeerError::UnexpectedMessage { .. }
        )
    }
}
