//! Error types shared by the fabric, the ring-buffer channel and every transport backend.

use thiserror::Error;

use crate::fabric::QpState;

/// Errors produced anywhere in the transport stack.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bootstrap connection to {addr} failed after {attempts} attempts: {reason}")]
    BootstrapFailure {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("integrity mismatch at byte {offset}: expected 0x{expected:02X}, got 0x{got:02X}")]
    IntegrityMismatch { offset: usize, expected: u8, got: u8 },

    #[error("resource exhausted: {reason}")]
    ResourceExhaustion { reason: String },

    #[error("invalid configuration: {reason}")]
    ConfigurationError { reason: String },

    #[error("RDMA not available: {reason}")]
    RdmaNotAvailable { reason: String },

    #[error("remote access error: {reason}")]
    RemoteAccess { reason: String },

    #[error("queue pair {qp_num} is in state {state:?}")]
    QueuePairState { qp_num: u32, state: QpState },

    #[error("not connected")]
    NotConnected,

    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("pending message of {needed} bytes does not fit into a {available} byte buffer")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("gave up waiting for {what} after {timeout_ms}ms")]
    SpinTimeout { what: &'static str, timeout_ms: u64 },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a bootstrap attempt that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::ConnectionRefused { .. }
            | TransportError::ConnectionTimeout { .. }
            | TransportError::ConnectionReset => true,
            TransportError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        TransportError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        TransportError::ConfigurationError {
            reason: reason.into(),
        }
    }
}

/// Maps a stream I/O error, turning a clean EOF into [`TransportError::ConnectionReset`].
pub(crate) fn map_stream_err(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => TransportError::ConnectionReset,
        _ => TransportError::IoError(e),
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
