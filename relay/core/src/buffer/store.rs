//! Token buffer store
//!
//! Keyed factory for buffers. Session ids are unique while a buffer is live.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{MemoryTokenBuffer, SharedBuffer, TokenBuffer, TokenLog};
use crate::error::{RelayError, Result};
use crate::session::SessionId;

/// Create, look up, and delete token buffers by session id
#[async_trait]
pub trait TokenBufferStore<T>: Send + Sync {
    /// Create an empty buffer
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionExists`] if a buffer already exists for `id`.
    async fn create(&self, id: &SessionId) -> Result<SharedBuffer<T>>;

    /// Look up a buffer
    async fn get(&self, id: &SessionId) -> Option<SharedBuffer<T>>;

    /// Remove a buffer; no-op if absent
    async fn delete(&self, id: &SessionId);

    /// Number of buffers currently stored
    async fn count(&self) -> usize;
}

/// Buffer store backed by a `DashMap`
pub struct MemoryTokenBufferStore<T> {
    buffers: DashMap<SessionId, Arc<MemoryTokenBuffer<T>>>,
}

impl<T> MemoryTokenBufferStore<T> {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: DashMap::new(),
        }
    }
}

impl<T> Default for MemoryTokenBufferStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> TokenBufferStore<T> for MemoryTokenBufferStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn create(&self, id: &SessionId) -> Result<SharedBuffer<T>> {
        match self.buffers.entry(id.clone()) {
            Entry::Occupied(_) => Err(RelayError::SessionExists(id.clone())),
            Entry::Vacant(slot) => {
                let buffer = Arc::new(MemoryTokenBuffer::new(id.clone()));
                slot.insert(Arc::clone(&buffer));
                tracing::debug!(session_id = %id, "Buffer created");
                Ok(buffer as SharedBuffer<T>)
            }
        }
    }

    async fn get(&self, id: &SessionId) -> Option<SharedBuffer<T>> {
        self.buffers
            .get(id)
            .map(|entry| Arc::clone(entry.value()) as SharedBuffer<T>)
    }

    async fn delete(&self, id: &SessionId) {
        let Some((_, buffer)) = self.buffers.remove(id) else {
            return;
        };
        // Nothing writes to a deleted log; wake anyone still parked on it
        if !buffer.is_terminal().await {
            buffer.fail(RelayError::SessionNotFound(id.clone())).await;
        }
        tracing::debug!(session_id = %id, "Buffer deleted");
    }

    async fn count(&self) -> usize {
        self.buffers.len()
    }
}
