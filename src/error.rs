use std::time::Duration;
use thiserror::Error;

use crate::network::handshake::HandshakeStatus;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// Failures of the raw socket connector.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("IPv6 is unavailable or disabled for {0}")]
    Ipv6Unavailable(String),

    #[error("No usable {mode} address for {target}")]
    NoAddress { target: String, mode: String },

    #[error("Failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {target} timed out after {timeout:?}")]
    TimedOut { target: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Violations of the wire framing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Length prefix exceeds {0} bytes")]
    PrefixTooLong(usize),

    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: usize, max: usize },
}

/// Protocol faults: the peer broke the rules and the connection is unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("Handshake message received out of order (status: {0:?})")]
    OutOfOrderHandshake(HandshakeStatus),

    #[error("Malformed version header: {0}")]
    MalformedHeader(String),

    #[error("Unsupported protocol version {got} (min: {min})")]
    UnsupportedVersion { got: u32, min: u32 },

    #[error("Empty handshake payload from peer")]
    EmptyPeerPayload,

    #[error("Framing error: {0}")]
    Frame(#[from] WireError),

    #[error("Peer stalled: {0} consecutive empty read cycles with an incomplete frame")]
    StalledReassembly(u32),

    #[error("Codec error: {0}")]
    Codec(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Refusing to connect with an empty handshake payload")]
    EmptyHandshakePayload,

    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String, peer_fault: bool },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol fault: {0}")]
    Protocol(#[from] ProtocolFault),

    #[error("Peer rejected: {0}")]
    PeerRejected(String),

    #[error("Connection not ready (handshake status: {0:?})")]
    NotReady(HandshakeStatus),

    #[error("Connection closed")]
    Closed,
}

impl ConnectionError {
    /// Faults caused by the remote side's behaviour; logged once and silenced.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ConnectionError::Protocol(_)
                | ConnectionError::PeerRejected(_)
                | ConnectionError::HandshakeFailed {
                    peer_fault: true,
                    ..
                }
        )
    }

    /// Expected during shutdown and timeout races, never alerted.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectionError::Cancelled)
    }
}
