//! Error types for wirecall.

use thiserror::Error;

/// Main error type for all wirecall operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol violation (oversized frame, bad handshake, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error string reported by the remote side for a single call.
    ///
    /// Displays as the remote text verbatim so callers see exactly what
    /// the handler returned.
    #[error("{0}")]
    Server(String),

    /// Service registration was rejected.
    #[error("{0}")]
    Register(String),

    /// The client connection is closed or closing; the sentinel returned
    /// for every call submitted after shutdown.
    #[error("connection is shut down")]
    Shutdown,
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
