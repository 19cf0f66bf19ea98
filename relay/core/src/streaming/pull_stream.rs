//! Cursor-based reader over a token buffer

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::StreamFrame;
use crate::buffer::{Lsn, SharedLog};
use crate::error::Result;
use crate::session::SessionId;

/// A single consumer's stream of frames from one buffer
///
/// Yields `Ok(frame)` for each token after the start position, then either
/// ends (buffer completed) or yields the buffer's stored error once and ends.
pub struct PullStream<T> {
    session_id: SessionId,
    start_lsn: Lsn,
    inner: BoxStream<'static, Result<StreamFrame<T>>>,
}

impl<T> PullStream<T> {
    /// Session the stream reads from
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Position the stream started after
    #[must_use]
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }
}

impl<T> Stream for PullStream<T> {
    type Item = Result<StreamFrame<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for PullStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullStream")
            .field("session_id", &self.session_id)
            .field("start_lsn", &self.start_lsn)
            .finish_non_exhaustive()
    }
}

/// Open a reader that yields every token with LSN greater than `start_lsn`
///
/// Each call gets its own cursor. Any number of readers may share a log.
pub fn pull_stream<T>(buffer: SharedLog<T>, start_lsn: Lsn) -> PullStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    let session_id = buffer.session_id().clone();
    tracing::debug!(session_id = %session_id, start_lsn, "Reader opened");

    let inner = stream::unfold(Some((buffer, start_lsn)), |state| async move {
        let (buffer, cursor) = state?;
        loop {
            let snapshot = buffer.read_range(cursor, 1).await;

            if let Some(token) = snapshot.tokens.into_iter().next() {
                let lsn = cursor + 1;
                return Some((Ok(StreamFrame { token, lsn }), Some((buffer, lsn))));
            }
            if let Some(error) = snapshot.error {
                tracing::debug!(
                    session_id = %buffer.session_id(),
                    lsn = cursor,
                    error = %error,
                    "Reader reached failed end of log"
                );
                return Some((Err(error), None));
            }
            if snapshot.completed {
                tracing::debug!(session_id = %buffer.session_id(), lsn = cursor, "Reader finished");
                return None;
            }

            buffer.wait_for_change(cursor).await;
        }
    })
    .boxed();

    PullStream {
        session_id,
        start_lsn,
        inner,
    }
}
