use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer went away without an end marker.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// Write attempted after the end marker.
    #[error("write half of stream {stream_id} already closed")]
    WriteClosed {
        /// Stream whose write half is closed.
        stream_id: u64,
    },

    /// Read attempted after the end marker.
    #[error("stream {stream_id} already ended")]
    StreamEnded {
        /// Stream that already ended.
        stream_id: u64,
    },

    /// No handler is registered for the method.
    #[error("unknown method: {method}")]
    UnknownMethod {
        /// Requested method name.
        method: String,
    },

    /// Malformed or out-of-order traffic.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was violated.
        reason: String,
    },
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
