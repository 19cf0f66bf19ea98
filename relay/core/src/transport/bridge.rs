//! Pull-to-push bridge
//!
//! Wraps a [`PullStream`] as a byte stream a transport can forward chunk by
//! chunk, e.g. `axum::body::Body::from_stream`.

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;

use super::frame::encode_frame;
use crate::buffer::Lsn;
use crate::error::RelayError;
use crate::registry::SessionLease;
use crate::streaming::PullStream;

/// Content type of the bridge output
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// NDJSON byte stream over one reader
///
/// Every poll from the transport drives the reader exactly one step and
/// yields one encoded line. The stream ends when the log completes. A stored
/// producer error is yielded as the final `Err` item so the transport aborts
/// the response instead of ending it cleanly.
///
/// One bridge per connection. Bridges never share a reader, but any number
/// may read the same buffer.
pub struct NdjsonBridge<T> {
    frames: PullStream<T>,
    lease: Option<SessionLease<T>>,
    span: tracing::Span,
    last_lsn: Lsn,
    done: bool,
}

impl<T> NdjsonBridge<T> {
    /// Bridge a reader
    #[must_use]
    pub fn new(frames: PullStream<T>) -> Self {
        Self {
            last_lsn: frames.start_lsn(),
            frames,
            lease: None,
            span: tracing::Span::none(),
            done: false,
        }
    }

    /// Hold a registry lease for as long as the bridge lives
    ///
    /// The lease is released when the transport drops the bridge, which is
    /// how a client disconnect turns into a registry release.
    #[must_use]
    pub fn with_lease(mut self, lease: SessionLease<T>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Log polls and the close event inside `span`
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// LSN of the last frame handed to the transport
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }
}

impl<T> Stream for NdjsonBridge<T>
where
    T: Serialize,
{
    type Item = Result<Bytes, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let _entered = this.span.enter();

        let item = match ready!(this.frames.poll_next_unpin(cx)) {
            Some(Ok(frame)) => match encode_frame(&frame) {
                Ok(line) => {
                    this.last_lsn = frame.lsn;
                    Ok(Bytes::from(line))
                }
                Err(e) => {
                    this.done = true;
                    Err(e)
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    session_id = %this.frames.session_id(),
                    lsn = this.last_lsn,
                    error = %e,
                    "Aborting stream on session error"
                );
                this.done = true;
                Err(e)
            }
            None => {
                this.done = true;
                return Poll::Ready(None);
            }
        };
        Poll::Ready(Some(item))
    }
}

impl<T> Drop for NdjsonBridge<T> {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        tracing::debug!(
            session_id = %self.frames.session_id(),
            last_lsn = self.last_lsn,
            finished = self.done,
            "Bridge closed"
        );
    }
}

impl<T> fmt::Debug for NdjsonBridge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdjsonBridge")
            .field("frames", &self.frames)
            .field("leased", &self.lease.is_some())
            .field("last_lsn", &self.last_lsn)
            .field("done", &self.done)
            .finish()
    }
}
