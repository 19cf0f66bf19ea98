//! Session registry store
//!
//! Bookkeeping entries keyed by session id.
//!
//! # Atomicity
//!
//! [`SessionRegistryStore::update_ref_count`] is the one primitive every
//! backend must make atomic across all registry instances sharing the store.
//! A lost update either leaks a session forever or deletes one a live client
//! still reads from. The in-memory store gets this from the per-shard write
//! lock `DashMap` takes in `get_mut`; a shared backend needs CAS or a
//! transaction.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{RelayError, Result};
use crate::session::{SessionEntry, SessionId};

/// Persistent map of session entries
#[async_trait]
pub trait SessionRegistryStore<T>: Send + Sync {
    /// Look up an entry
    async fn get(&self, id: &SessionId) -> Option<SessionEntry<T>>;

    /// Insert or replace an entry
    async fn set(&self, id: &SessionId, entry: SessionEntry<T>);

    /// Remove an entry, returning whether one existed
    async fn delete(&self, id: &SessionId) -> bool;

    /// Atomically add `delta` to the ref count and return the new value
    ///
    /// # Errors
    ///
    /// - [`RelayError::SessionNotFound`] if no entry exists
    /// - [`RelayError::RegistryRace`] if the count would go negative
    async fn update_ref_count(&self, id: &SessionId, delta: i64) -> Result<u32>;

    /// Ids of all stored entries
    async fn ids(&self) -> Vec<SessionId>;
}

/// Registry store backed by a `DashMap`
pub struct MemorySessionStore<T> {
    entries: DashMap<SessionId, SessionEntry<T>>,
}

impl<T> MemorySessionStore<T> {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> Default for MemorySessionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> SessionRegistryStore<T> for MemorySessionStore<T>
where
    T: Send + Sync + 'static,
{
    async fn get(&self, id: &SessionId) -> Option<SessionEntry<T>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    async fn set(&self, id: &SessionId, entry: SessionEntry<T>) {
        self.entries.insert(id.clone(), entry);
    }

    async fn delete(&self, id: &SessionId) -> bool {
        self.entries.remove(id).is_some()
    }

    async fn update_ref_count(&self, id: &SessionId, delta: i64) -> Result<u32> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.clone()))?;

        let next = i64::from(entry.ref_count) + delta;
        let next = u32::try_from(next).map_err(|_| {
            RelayError::RegistryRace(format!(
                "ref count for {id} would become {next} (was {})",
                entry.ref_count
            ))
        })?;
        entry.ref_count = next;
        Ok(next)
    }

    async fn ids(&self) -> Vec<SessionId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
