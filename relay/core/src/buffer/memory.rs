//! In-memory token buffer

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use std::sync::Arc;

use super::{Lsn, ReadResult, SharedLog, TokenBuffer, TokenLog};
use crate::error::{RelayError, Result};
use crate::session::SessionId;

#[derive(Debug)]
struct BufferState<T> {
    tokens: Vec<T>,
    completed: bool,
    error: Option<RelayError>,
}

impl<T> BufferState<T> {
    fn is_terminal(&self) -> bool {
        self.completed || self.error.is_some()
    }

    fn len(&self) -> Lsn {
        self.tokens.len() as Lsn
    }
}

/// Token buffer held in process memory
///
/// State sits behind a `parking_lot::RwLock` that is never held across an
/// await point. Every mutation bumps a `watch` revision that parked readers
/// subscribe to.
pub struct MemoryTokenBuffer<T> {
    session_id: SessionId,
    state: RwLock<BufferState<T>>,
    revision: watch::Sender<u64>,
}

impl<T> MemoryTokenBuffer<T> {
    /// Create an empty buffer for a session
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            session_id,
            state: RwLock::new(BufferState {
                tokens: Vec::new(),
                completed: false,
                error: None,
            }),
            revision,
        }
    }

    fn notify(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn ready(&self, after: Lsn) -> bool {
        let state = self.state.read();
        state.len() > after || state.is_terminal()
    }
}

#[async_trait]
impl<T> TokenBuffer<T> for MemoryTokenBuffer<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn append(&self, items: Vec<T>) -> Result<Lsn> {
        let lsn = {
            let mut state = self.state.write();
            if state.is_terminal() {
                return Err(RelayError::BufferClosed(self.session_id.clone()));
            }
            state.tokens.extend(items);
            state.len()
        };
        self.notify();
        Ok(lsn)
    }

    async fn complete(&self) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            state.completed = true;
        }
        tracing::debug!(session_id = %self.session_id, "Buffer completed");
        self.notify();
    }

    async fn fail(&self, error: RelayError) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            state.error = Some(error);
        }
        tracing::debug!(session_id = %self.session_id, "Buffer failed");
        self.notify();
    }

    fn into_log(self: Arc<Self>) -> SharedLog<T> {
        self
    }
}

#[async_trait]
impl<T> TokenLog<T> for MemoryTokenBuffer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn read_range(&self, after: Lsn, limit: usize) -> ReadResult<T> {
        let state = self.state.read();
        let start = usize::try_from(after)
            .unwrap_or(usize::MAX)
            .min(state.tokens.len());
        let tokens = state.tokens[start..].iter().take(limit).cloned().collect();
        ReadResult {
            tokens,
            lsn: state.len(),
            completed: state.completed,
            error: state.error.clone(),
        }
    }

    async fn is_complete(&self) -> bool {
        self.state.read().completed
    }

    async fn error(&self) -> Option<RelayError> {
        self.state.read().error.clone()
    }

    async fn len(&self) -> Lsn {
        self.state.read().len()
    }

    async fn wait_for_change(&self, after: Lsn) {
        // Subscribe before checking so a change between the check and the
        // await still wakes us.
        let mut revision = self.revision.subscribe();
        while !self.ready(after) {
            if revision.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<T> std::fmt::Debug for MemoryTokenBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryTokenBuffer")
            .field("session_id", &self.session_id)
            .field("len", &state.len())
            .field("completed", &state.completed)
            .field("error", &state.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn buffer() -> MemoryTokenBuffer<String> {
        MemoryTokenBuffer::new(SessionId::from("test"))
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_append_returns_lsn() {
        let buf = buffer();
        assert_eq!(buf.append(strings(&["a"])).await.unwrap(), 1);
        assert_eq!(buf.append(strings(&["b", "c"])).await.unwrap(), 3);
        assert_eq!(buf.len().await, 3);
    }

    #[tokio::test]
    async fn test_read_returns_suffix() {
        let buf = buffer();
        buf.append(strings(&["a", "b", "c", "d"])).await.unwrap();

        for after in 0..=5 {
            let read = buf.read(after).await;
            let expected: Vec<String> = strings(&["a", "b", "c", "d"])
                .into_iter()
                .skip(after as usize)
                .collect();
            assert_eq!(read.tokens, expected, "suffix after {after}");
            assert_eq!(read.lsn, 4);
        }
    }

    #[tokio::test]
    async fn test_read_range_limits_batch() {
        let buf = buffer();
        buf.append(strings(&["a", "b", "c"])).await.unwrap();
        let read = buf.read_range(1, 1).await;
        assert_eq!(read.tokens, strings(&["b"]));
        assert_eq!(read.lsn, 3);
    }

    #[tokio::test]
    async fn test_append_after_complete_is_rejected() {
        let buf = buffer();
        buf.append(strings(&["a"])).await.unwrap();
        buf.complete().await;

        let err = buf.append(strings(&["b"])).await.unwrap_err();
        assert_eq!(err, RelayError::BufferClosed(SessionId::from("test")));
        assert_eq!(buf.len().await, 1);
    }

    #[tokio::test]
    async fn test_append_after_fail_is_rejected() {
        let buf = buffer();
        buf.fail(RelayError::producer("boom")).await;
        assert!(matches!(
            buf.append(strings(&["a"])).await,
            Err(RelayError::BufferClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_first_terminal_state_wins() {
        let buf = buffer();
        buf.complete().await;
        buf.fail(RelayError::producer("late")).await;
        assert!(buf.is_complete().await);
        assert_eq!(buf.error().await, None);

        let buf = buffer();
        buf.fail(RelayError::producer("first")).await;
        buf.complete().await;
        assert!(!buf.is_complete().await);
        assert_eq!(buf.error().await, Some(RelayError::producer("first")));
    }

    #[tokio::test]
    async fn test_wait_for_change_returns_immediately_when_ready() {
        let buf = buffer();
        buf.append(strings(&["a"])).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), buf.wait_for_change(0))
            .await
            .expect("data already past position");

        buf.complete().await;
        tokio::time::timeout(Duration::from_millis(100), buf.wait_for_change(1))
            .await
            .expect("terminal buffer never blocks");
    }

    #[tokio::test]
    async fn test_wait_for_change_wakes_on_append() {
        let buf = Arc::new(buffer());
        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.wait_for_change(0).await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        buf.append(strings(&["a"])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_change_wakes_on_fail() {
        let buf = Arc::new(buffer());
        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.wait_for_change(0).await })
        };

        buf.fail(RelayError::Aborted).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
