//! Relay Errors
//!
//! A single error type shared by buffers, stores, the registry, and readers.
//!
//! `RelayError` is `Clone` because a producer failure is stored inside the
//! token buffer and handed to every reader that reaches the end of the log,
//! including readers that connect long after the failure happened.

use thiserror::Error;

use crate::session::SessionId;

/// Convenience alias used throughout the crate
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors produced by the durable streaming subsystem
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Append attempted after the buffer reached a terminal state
    #[error("buffer for session {0} is closed")]
    BufferClosed(SessionId),

    /// No registry entry (or buffer) exists for the session
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Acquire of an unknown session without a producer to create it from
    #[error("session {0} not found and no source provided")]
    MissingSource(SessionId),

    /// A buffer for this session id already exists
    #[error("session {0} already exists")]
    SessionExists(SessionId),

    /// The producer stream failed; stored in the buffer for all readers
    #[error("producer error: {0}")]
    Producer(String),

    /// The session was explicitly aborted
    #[error("session aborted")]
    Aborted,

    /// The producer went silent for longer than the idle timeout
    #[error("producer idle for more than {idle_ms}ms")]
    TimedOut {
        /// The idle timeout that elapsed, in milliseconds
        idle_ms: u64,
    },

    /// Store-level inconsistency (e.g. ref count would go negative)
    #[error("registry race: {0}")]
    RegistryRace(String),

    /// Wire encoding/decoding or HTTP transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Create a producer error from anything displayable
    pub fn producer(err: impl std::fmt::Display) -> Self {
        Self::Producer(err.to_string())
    }

    /// Whether this error means "the session does not exist here"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::MissingSource(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
