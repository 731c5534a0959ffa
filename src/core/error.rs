//! Error types for the session layer.

use thiserror::Error;

/// Errors surfaced by sockets, poll sets and the transport context.
///
/// A bounded [`PollSet::wait`](crate::poll::PollSet::wait) that expires is
/// not an error; it returns empty readiness sets.
#[derive(Debug, Error)]
pub enum SrtError {
    /// The local address could not be bound.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// The socket could not enter listening mode.
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// Connection setup failed (unresolvable, refused, rejected or timed out).
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A pending connection could not be accepted.
    #[error("accept failed: {0}")]
    AcceptFailed(String),

    /// Data could not be handed to the transport.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Data could not be read from the transport.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The socket has been closed.
    #[error("socket is closed")]
    Closed,

    /// The readiness multiplexer could not wait.
    #[error("poll failed: {0}")]
    PollFailed(String),

    /// A non-blocking operation could not complete immediately.
    #[error("operation would block")]
    WouldBlock,

    /// An argument was rejected before reaching the transport.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transport context has been shut down.
    #[error("transport context has been shut down")]
    Shutdown,

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SrtError {
    /// Whether the error only means "try again later".
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Result type for session operations.
pub type SrtResult<T> = Result<T, SrtError>;
