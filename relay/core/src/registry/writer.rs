//! Writer task
//!
//! Drains one producer into one buffer. Spawned detached by the registry, so
//! it keeps running after the request that created the session is gone.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::TokenSource;
use crate::buffer::{SharedBuffer, TokenBuffer, TokenLog};
use crate::error::RelayError;
use crate::session::SessionStatus;

/// Status a session ends in when its buffer holds `error`
pub(crate) fn status_for_error(error: &RelayError) -> SessionStatus {
    match error {
        RelayError::Aborted => SessionStatus::Aborted,
        RelayError::TimedOut { .. } => SessionStatus::Timeout,
        _ => SessionStatus::Error,
    }
}

/// Write every item of `source` into `buffer`, then complete it
///
/// A producer error fails the buffer instead of being returned, so every
/// reader sees it. With `idle_timeout` set, a producer that yields nothing for
/// that long fails the buffer with [`RelayError::TimedOut`].
///
/// Returns the status the session ended in. The buffer is terminal by then.
pub async fn drain_into<T>(
    mut source: TokenSource<T>,
    buffer: &SharedBuffer<T>,
    idle_timeout: Option<Duration>,
) -> SessionStatus
where
    T: Send + 'static,
{
    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let idle_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(
                        session_id = %buffer.session_id(),
                        idle_ms,
                        "Producer idle timeout"
                    );
                    buffer.fail(RelayError::TimedOut { idle_ms }).await;
                    return SessionStatus::Timeout;
                }
            },
            None => source.next().await,
        };

        match next {
            Some(Ok(item)) => {
                if let Err(e) = buffer.append(vec![item]).await {
                    // Closed underneath us: the session was deleted
                    tracing::debug!(
                        session_id = %buffer.session_id(),
                        error = %e,
                        "Writer stopped"
                    );
                    return match buffer.error().await {
                        Some(stored) => status_for_error(&stored),
                        None => SessionStatus::Complete,
                    };
                }
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %buffer.session_id(), error = %e, "Producer failed");
                let status = status_for_error(&e);
                buffer.fail(e).await;
                return status;
            }
            None => {
                buffer.complete().await;
                return SessionStatus::Complete;
            }
        }
    }
}

/// Publishes the writer's final status exactly once
///
/// If the writer task unwinds before publishing, the drop fails the buffer
/// and reports [`SessionStatus::Error`], so readers and cleanup waiters are
/// not left waiting on a writer that is gone.
struct StatusGuard<T: 'static> {
    buffer: SharedBuffer<T>,
    status: Option<watch::Sender<SessionStatus>>,
}

impl<T: 'static> StatusGuard<T> {
    fn new(buffer: SharedBuffer<T>, status: watch::Sender<SessionStatus>) -> Self {
        Self {
            buffer,
            status: Some(status),
        }
    }

    fn publish(mut self, final_status: SessionStatus) {
        if let Some(status) = self.status.take() {
            status.send_replace(final_status);
        }
    }
}

impl<T: 'static> Drop for StatusGuard<T> {
    fn drop(&mut self) {
        let Some(status) = self.status.take() else {
            return;
        };
        let buffer = Arc::clone(&self.buffer);
        tracing::error!(
            session_id = %buffer.session_id(),
            "Writer stopped without a final status"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    buffer
                        .fail(RelayError::producer("writer stopped unexpectedly"))
                        .await;
                    status.send_replace(SessionStatus::Error);
                });
            }
            Err(_) => {
                status.send_replace(SessionStatus::Error);
            }
        }
    }
}

/// Body of the spawned writer task
///
/// Publishes the final status only after the buffer is terminal, so anyone
/// woken by the status change finds the buffer settled.
pub(crate) async fn run_writer<T>(
    source: TokenSource<T>,
    buffer: SharedBuffer<T>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
) where
    T: Send + 'static,
{
    tracing::debug!("Writer started");
    let guard = StatusGuard::new(Arc::clone(&buffer), status);

    let final_status = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            buffer.fail(RelayError::Aborted).await;
            SessionStatus::Aborted
        }
        ended = drain_into(source, &buffer, idle_timeout) => ended,
    };

    let lsn = buffer.len().await;
    tracing::info!(status = %final_status, lsn, "Writer finished");
    guard.publish(final_status);
}

#[cfg(test)]
mod tests {
    use std::task::Poll;

    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::{source_from_channel, source_from_iter, source_from_results};
    use crate::buffer::MemoryTokenBuffer;
    use crate::session::SessionId;

    fn buffer() -> SharedBuffer<String> {
        Arc::new(MemoryTokenBuffer::new(SessionId::from("w")))
    }

    #[tokio::test]
    async fn test_drain_completes() {
        let buf = buffer();
        let status = drain_into(
            source_from_iter(vec!["a".to_string(), "b".to_string()]),
            &buf,
            None,
        )
        .await;

        assert_eq!(status, SessionStatus::Complete);
        assert!(buf.is_complete().await);
        assert_eq!(buf.len().await, 2);
    }

    #[tokio::test]
    async fn test_drain_stores_producer_error() {
        let buf = buffer();
        let status = drain_into(
            source_from_results(vec![
                Ok("a".to_string()),
                Err(RelayError::producer("bad")),
            ]),
            &buf,
            None,
        )
        .await;

        assert_eq!(status, SessionStatus::Error);
        assert_eq!(buf.error().await, Some(RelayError::producer("bad")));
        assert_eq!(buf.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_idle_timeout() {
        let buf = buffer();
        let (tx, rx) = mpsc::channel(1);
        tx.send(Ok("first".to_string())).await.unwrap();

        let status = drain_into(
            source_from_channel(rx),
            &buf,
            Some(Duration::from_millis(250)),
        )
        .await;
        drop(tx);

        assert_eq!(status, SessionStatus::Timeout);
        assert_eq!(
            buf.error().await,
            Some(RelayError::TimedOut { idle_ms: 250 })
        );
        assert_eq!(buf.len().await, 1);
    }

    #[tokio::test]
    async fn test_writer_abort() {
        let buf = buffer();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Streaming);

        let task = tokio::spawn(run_writer(
            stream::pending().boxed(),
            Arc::clone(&buf),
            None,
            cancel.clone(),
            status_tx,
        ));
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(*status_rx.borrow(), SessionStatus::Aborted);
        assert_eq!(buf.error().await, Some(RelayError::Aborted));
    }

    #[tokio::test]
    async fn test_writer_panic_still_settles() {
        let buf = buffer();
        let (status_tx, mut status_rx) = watch::channel(SessionStatus::Streaming);
        let source = stream::iter(vec![Ok("a".to_string())])
            .chain(stream::poll_fn(|_| -> Poll<Option<Result<String, RelayError>>> {
                panic!("producer bug")
            }))
            .boxed();

        let task = tokio::spawn(run_writer(
            source,
            Arc::clone(&buf),
            None,
            CancellationToken::new(),
            status_tx,
        ));
        assert!(task.await.unwrap_err().is_panic());

        let settled = status_rx
            .wait_for(|status| !status.is_streaming())
            .await
            .map(|status| *status);
        assert_eq!(settled.ok(), Some(SessionStatus::Error));
        assert_eq!(buf.len().await, 1);
        assert_eq!(
            buf.error().await,
            Some(RelayError::producer("writer stopped unexpectedly"))
        );
    }

    #[test]
    fn test_status_for_error() {
        assert_eq!(status_for_error(&RelayError::Aborted), SessionStatus::Aborted);
        assert_eq!(
            status_for_error(&RelayError::TimedOut { idle_ms: 1 }),
            SessionStatus::Timeout
        );
        assert_eq!(
            status_for_error(&RelayError::producer("x")),
            SessionStatus::Error
        );
    }
}
