//! Reader Side of a Session
//!
//! A [`PullStream`] is one consumer's private cursor over a token buffer.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────┐
//!   writer task ───> │       TokenBuffer        │
//!                    │  1   2   3   4   5   ...  │
//!                    └──┬───────────┬───────────┘
//!                       │           │
//!              PullStream(0)   PullStream(3)      (independent cursors)
//!                       │           │
//!                  NdjsonBridge  NdjsonBridge     (one per HTTP response)
//! ```
//!
//! # Guarantees
//!
//! - Frames arrive in strictly increasing LSN order with no gaps or repeats
//! - The cursor advances exactly one token per frame, so a client that drops
//!   between any two frames can resume from the last LSN it saw
//! - Readers never lock each other out; a slow reader only delays itself
//! - Dropping a reader cancels that reader and nothing else
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use relay_core::streaming::pull_stream;
//!
//! let mut frames = pull_stream(handle.buffer().clone(), last_seen_lsn);
//! while let Some(frame) = frames.next().await {
//!     let frame = frame?;
//!     print!("{}", frame.token);
//! }
//! ```

mod pull_stream;

use serde::{Deserialize, Serialize};

use crate::buffer::Lsn;

pub use pull_stream::{pull_stream, PullStream};

/// One token together with its position in the log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame<T> {
    /// The token
    pub token: T,
    /// Its LSN (1-indexed)
    pub lsn: Lsn,
}
