//! Protocol parameters -- the fixed timing, sizing and retry constants that
//! the transport, discovery and sync layers agree on.
//!
//! Frame byte widths live in [`crate::frame`]; everything tunable at the
//! protocol level lives here so a single const describes one wire profile.

/// A named set of protocol-level parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// DevP2P base protocol version advertised in Hello.
    pub p2p_version: u64,
    /// RLPx handshake (EIP-8) version carried in Auth/AuthAck.
    pub handshake_version: u64,

    // -- Transport --
    /// Largest payload chunk carried by a single frame.
    pub frame_chunk_bytes: usize,
    /// Largest reassembled message accepted from a peer.
    pub max_message_bytes: usize,
    /// Seconds allowed for the crypto handshake plus Hello exchange.
    pub handshake_timeout_secs: u64,

    // -- Keepalive --
    /// Seconds between DevP2P pings on an idle session.
    pub ping_interval_secs: u64,
    /// Seconds without inbound traffic before the session is dropped.
    pub idle_timeout_secs: u64,

    // -- Discovery --
    /// Nodes queried concurrently per lookup round.
    pub discovery_alpha: usize,
    /// Seconds a discovery packet stays valid after sending.
    pub discovery_expiration_secs: u64,
    /// Seconds a discovery session waits for any answer.
    pub discovery_session_timeout_secs: u64,

    // -- Tasks --
    /// Seconds before an outstanding request counts as timed out.
    pub request_timeout_secs: u64,
    /// Attempts (first send included) before a task is reported failed.
    pub max_task_attempts: u32,
    /// Headers requested per window during sync.
    pub headers_limit: u64,
}

/// LES v2 over RLPx v4 with EIP-8 handshakes.
pub const LES_V2_PARAMS: ProtocolParams = ProtocolParams {
    p2p_version: 4,
    handshake_version: 4,

    // Transport
    frame_chunk_bytes: 16 * 1024,
    max_message_bytes: 16 * 1024 * 1024,
    handshake_timeout_secs: 10,

    // Keepalive
    ping_interval_secs: 15,
    idle_timeout_secs: 60,

    // Discovery
    discovery_alpha: 3,
    discovery_expiration_secs: 20,
    discovery_session_timeout_secs: 10,

    // Tasks
    request_timeout_secs: 10,
    max_task_attempts: 3,
    headers_limit: 50,
};

/// The parameter set used by default.
pub const CURRENT_PARAMS: &ProtocolParams = &LES_V2_PARAMS;
