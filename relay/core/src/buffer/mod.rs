//! Token Buffers
//!
//! The append-only, per-session token log and its keyed store.
//!
//! # Log Model
//!
//! ```text
//!  LSN:     1        2        3        4
//!        ┌────────┬────────┬────────┬────────┐
//!        │ "Hel"  │ "lo"   │ " wor" │ "ld"   │ ── complete / error
//!        └────────┴────────┴────────┴────────┘
//!                     ▲                 ▲
//!               reader A cursor    reader B cursor
//! ```
//!
//! The i-th token (1-indexed) has LSN i. A buffer has exactly one writer and
//! any number of readers, each with a private cursor. Once a buffer is
//! completed or failed it never changes again.
//!
//! # Backend Contract
//!
//! [`TokenLog`], [`TokenBuffer`] and [`TokenBufferStore`] are traits so the
//! log can live in a shared store. Readers see a [`TokenLog`]; the writer
//! side [`TokenBuffer`] never leaves the registry. Any implementation must
//! guarantee that [`TokenLog::wait_for_change`] returns without suspending
//! when the condition already holds at call time, and otherwise wakes on the
//! next append or terminal transition. The in-memory implementation uses a
//! `tokio::sync::watch` notification; distributed backends may use pub/sub.

mod memory;
mod store;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::session::SessionId;

pub use memory::MemoryTokenBuffer;
pub use store::{MemoryTokenBufferStore, TokenBufferStore};

/// Log sequence number: 1-indexed position of a token in a buffer
pub type Lsn = u64;

/// Shared, type-erased buffer reference with write access
pub type SharedBuffer<T> = Arc<dyn TokenBuffer<T>>;

/// Shared, type-erased read-only log reference
pub type SharedLog<T> = Arc<dyn TokenLog<T>>;

/// Snapshot returned by [`TokenLog::read`]
///
/// Token data and terminal state are captured together, so a reader that sees
/// no tokens and `completed == true` knows nothing more will ever arrive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResult<T> {
    /// Tokens with LSN greater than the requested position
    pub tokens: Vec<T>,
    /// Buffer length at snapshot time
    pub lsn: Lsn,
    /// Whether the buffer was completed at snapshot time
    pub completed: bool,
    /// Stored error at snapshot time
    pub error: Option<RelayError>,
}

impl<T> ReadResult<T> {
    /// Whether the snapshot shows a terminal buffer
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.completed || self.error.is_some()
    }
}

/// Read side of a session's token log
///
/// This is all a reader gets. Appending and ending the log go through
/// [`TokenBuffer`], which only the registry and its writer task hold.
#[async_trait]
pub trait TokenLog<T>: Send + Sync {
    /// The session this log belongs to
    fn session_id(&self) -> &SessionId;

    /// Snapshot at most `limit` tokens after `after`
    async fn read_range(&self, after: Lsn, limit: usize) -> ReadResult<T>;

    /// Snapshot every token after `after`
    async fn read(&self, after: Lsn) -> ReadResult<T> {
        self.read_range(after, usize::MAX).await
    }

    /// Whether the log was completed
    async fn is_complete(&self) -> bool;

    /// The stored error, if the log failed
    async fn error(&self) -> Option<RelayError>;

    /// Current number of tokens
    async fn len(&self) -> Lsn;

    /// Whether the log is complete or failed
    async fn is_terminal(&self) -> bool {
        self.is_complete().await || self.error().await.is_some()
    }

    /// Suspend until the log grows past `after` or becomes terminal
    async fn wait_for_change(&self, after: Lsn);
}

/// Append-only token log for a single session, writer side
#[async_trait]
pub trait TokenBuffer<T>: TokenLog<T> {
    /// Append items, returning the LSN of the last one
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BufferClosed`] once the buffer is terminal.
    async fn append(&self, items: Vec<T>) -> Result<Lsn>;

    /// Mark the log as complete; no-op if already terminal
    async fn complete(&self);

    /// Store a terminal error; no-op if already terminal
    async fn fail(&self, error: RelayError);

    /// The same buffer, narrowed to its read side
    fn into_log(self: Arc<Self>) -> SharedLog<T>;
}
