//! Peer wire protocol and per-peer session logic.
use std::time::Duration;
use thiserror::Error;
pub mod handshake;
pub mod message;
pub mod session;

/// Zero-length frames are sent this often to keep idle connections open.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Upper bound on requests in flight to a single peer, and on the depth of
/// the scheduler's per-peer block queue.
pub const BLOCKS_TO_QUEUE: usize = 50;

/// TCP connect timeout for outgoing peer connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: invalid protocol identifier")]
    InvalidProtocol,

    #[error("handshake failed: info hash mismatch")]
    InfoHashMismatch,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
