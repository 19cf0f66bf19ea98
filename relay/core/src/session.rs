//! Session Types
//!
//! Identity, status, and bookkeeping for durable streaming sessions.
//!
//! # Design Philosophy
//!
//! A session is one producer run. It is independent of any consumer
//! connection: consumers hold a [`SessionHandle`] while they are interested,
//! drop it when they disconnect, and may come back later with the same
//! [`SessionId`] to pick up where they left off.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::buffer::{Lsn, SharedLog};

/// Session identifier
///
/// Caller-chosen or generated. Unique among live sessions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("sess_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a session's writer
///
/// ```text
///               ┌──> Complete
///               ├──> Error
/// Streaming ────┼──> Aborted
///               └──> Timeout
///
/// Orphaned: buffer found without a running writer
/// ```
///
/// Only the writer task (or orphan adoption) moves a session between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Writer is draining the producer
    Streaming,
    /// Producer finished normally
    Complete,
    /// Producer raised an error
    Error,
    /// Session was explicitly aborted
    Aborted,
    /// Producer exceeded the idle timeout
    Timeout,
    /// Buffer exists but no writer owns it
    Orphaned,
}

impl SessionStatus {
    /// Whether the writer has finished for good
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Error | Self::Aborted | Self::Timeout
        )
    }

    /// Whether a writer is still running for this session
    #[must_use]
    pub fn is_streaming(self) -> bool {
        self == Self::Streaming
    }

    /// Short lowercase name, matching the serialized form
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Distinguishes two sessions that reused the same id over time
fn next_generation() -> u64 {
    static GENERATION: AtomicU64 = AtomicU64::new(1);
    GENERATION.fetch_add(1, Ordering::SeqCst)
}

/// Read-only view of a session handed to callers
///
/// Exposes the log for reading and the writer's status. Appending, ending
/// the log, and deletion stay with the registry and its writer task.
pub struct SessionHandle<T> {
    id: SessionId,
    buffer: SharedLog<T>,
    status: watch::Receiver<SessionStatus>,
    created_at: DateTime<Utc>,
    generation: u64,
}

impl<T> SessionHandle<T> {
    /// Create a handle for a freshly created or adopted session
    pub(crate) fn new(
        id: SessionId,
        buffer: SharedLog<T>,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            id,
            buffer,
            status,
            created_at: Utc::now(),
            generation: next_generation(),
        }
    }

    /// The session id
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Read-only view of the session's token log
    #[must_use]
    pub fn buffer(&self) -> &SharedLog<T> {
        &self.buffer
    }

    /// Current writer status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// When the session was created
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether two handles refer to the same session instance
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        self.generation == other.generation
    }

    /// Wait until the writer leaves `Streaming`
    ///
    /// Returns immediately for sessions that are already finished or orphaned.
    pub async fn wait_until_settled(&self) -> SessionStatus {
        let mut rx = self.status.clone();
        let settled = rx
            .wait_for(|status| !status.is_streaming())
            .await
            .map(|status| *status);
        // Writer gone without a final update; report what we last saw
        settled.unwrap_or_else(|_| *rx.borrow())
    }
}

impl<T> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            buffer: self.buffer.clone(),
            status: self.status.clone(),
            created_at: self.created_at,
            generation: self.generation,
        }
    }
}

impl<T> fmt::Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Registry bookkeeping for one session
pub struct SessionEntry<T> {
    /// Number of live acquirers
    pub ref_count: u32,
    /// Handle returned to acquirers
    pub handle: SessionHandle<T>,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
}

impl<T> SessionEntry<T> {
    /// Entry for a session that was just acquired for the first time
    #[must_use]
    pub fn new(handle: SessionHandle<T>) -> Self {
        Self {
            ref_count: 1,
            created_at: handle.created_at(),
            handle,
        }
    }
}

impl<T> Clone for SessionEntry<T> {
    fn clone(&self) -> Self {
        Self {
            ref_count: self.ref_count,
            handle: self.handle.clone(),
            created_at: self.created_at,
        }
    }
}

impl<T> fmt::Debug for SessionEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEntry")
            .field("ref_count", &self.ref_count)
            .field("handle", &self.handle)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Serializable snapshot of a session, as reported over the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id
    pub session_id: SessionId,
    /// Writer status
    pub status: SessionStatus,
    /// Current buffer length
    pub lsn: Lsn,
    /// Live acquirers
    pub ref_count: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Stored terminal error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("sess_"));
    }

    #[test]
    fn test_session_id_serde_transparent() {
        let id = SessionId::from("s1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s1\"");
    }

    #[test]
    fn test_status_classification() {
        assert!(SessionStatus::Streaming.is_streaming());
        assert!(!SessionStatus::Streaming.is_terminal());
        assert!(!SessionStatus::Orphaned.is_terminal());
        assert!(!SessionStatus::Orphaned.is_streaming());
        for status in [
            SessionStatus::Complete,
            SessionStatus::Error,
            SessionStatus::Aborted,
            SessionStatus::Timeout,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert_eq!(SessionStatus::Timeout.to_string(), "timeout");
    }
}
