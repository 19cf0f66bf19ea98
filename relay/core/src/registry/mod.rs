//! Session Registry
//!
//! Reference-counted ownership of sessions and their writer tasks.
//!
//! # Lifecycle
//!
//! ```text
//! acquire(id, source) ──> create buffer ──> spawn writer ──> ref_count = 1
//! acquire(id)         ──> ref_count += 1 ──> same handle
//! release(id)         ──> ref_count -= 1
//!                              │
//!                         ref_count == 0?
//!                    ┌─────────┴──────────┐
//!             writer finished       writer streaming
//!                    │                    │
//!              delete now         cleanup waiter: wait for writer,
//!                                 re-read ref_count, delete if still 0
//! ```
//!
//! The writer never depends on who is listening. A client that disconnects
//! mid-stream releases its reference; the producer keeps filling the buffer,
//! and a client that re-acquires the same id before cleanup resumes from any
//! LSN it already saw.
//!
//! # Concurrency
//!
//! Acquire, release, and the cleanup waiter's re-check are serialized by one
//! async lifecycle lock per registry. This is what guarantees at most one
//! writer per session id, and that a waiter never deletes a session that was
//! re-acquired while it slept. Registries sharing a store across processes
//! rely on the store's atomic [`SessionRegistryStore::update_ref_count`]
//! instead.

mod store;
mod writer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::TokenSource;
use crate::buffer::{
    MemoryTokenBufferStore, SharedBuffer, TokenBuffer, TokenBufferStore, TokenLog,
};
use crate::error::{RelayError, Result};
use crate::session::{SessionEntry, SessionHandle, SessionId, SessionInfo, SessionStatus};

pub use store::{MemorySessionStore, SessionRegistryStore};
pub use writer::drain_into;

/// Runtime settings for a registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Fail a session whose producer yields nothing for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Options for [`SessionRegistry::acquire`]
pub struct AcquireOptions<T> {
    /// Producer used when the session does not exist yet
    ///
    /// Ignored when the session already exists.
    pub source: Option<TokenSource<T>>,
    /// Fail with [`RelayError::SessionExists`] instead of joining a live session
    pub create_only: bool,
}

impl<T> AcquireOptions<T> {
    /// Join an existing session only
    #[must_use]
    pub fn existing() -> Self {
        Self {
            source: None,
            create_only: false,
        }
    }

    /// Create the session from `source` if it does not exist yet
    #[must_use]
    pub fn with_source(source: TokenSource<T>) -> Self {
        Self {
            source: Some(source),
            create_only: false,
        }
    }

    /// Create a new session from `source`; an existing id is an error
    #[must_use]
    pub fn create(source: TokenSource<T>) -> Self {
        Self {
            source: Some(source),
            create_only: true,
        }
    }
}

impl<T> Default for AcquireOptions<T> {
    fn default() -> Self {
        Self::existing()
    }
}

impl<T> fmt::Debug for AcquireOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireOptions")
            .field("has_source", &self.source.is_some())
            .field("create_only", &self.create_only)
            .finish()
    }
}

/// Counts across all registered sessions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    /// Number of registered sessions
    pub total_sessions: usize,
    /// Sum of ref counts
    pub total_refs: u64,
    /// Count by status name
    pub by_status: HashMap<String, usize>,
}

struct WriterHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct RegistryInner<T> {
    buffers: Arc<dyn TokenBufferStore<T>>,
    entries: Arc<dyn SessionRegistryStore<T>>,
    writers: DashMap<SessionId, WriterHandle>,
    lifecycle: Mutex<()>,
    config: RegistryConfig,
}

/// Owner of all sessions in a process
///
/// Cheap to clone; clones share the same sessions.
pub struct SessionRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for SessionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("writers", &self.inner.writers.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T> SessionRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Registry over fresh in-memory stores
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_stores(
            Arc::new(MemoryTokenBufferStore::<T>::new()),
            Arc::new(MemorySessionStore::<T>::new()),
            config,
        )
    }

    /// Registry over caller-provided stores
    #[must_use]
    pub fn with_stores(
        buffers: Arc<dyn TokenBufferStore<T>>,
        entries: Arc<dyn SessionRegistryStore<T>>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                buffers,
                entries,
                writers: DashMap::new(),
                lifecycle: Mutex::new(()),
                config,
            }),
        }
    }

    /// The registry's settings
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Take a reference to a session, creating it if needed
    ///
    /// An existing session gains one reference and its handle is returned;
    /// `options.source` is dropped unused. A buffer without a registry entry
    /// is adopted. Otherwise a new buffer is created and a detached writer
    /// starts draining `options.source` into it.
    ///
    /// # Errors
    ///
    /// - [`RelayError::MissingSource`] if the session is unknown and no source was given
    /// - [`RelayError::SessionExists`] if `options.create_only` is set and the
    ///   id is taken, by a registered session or a stored buffer
    /// - Store errors such as [`RelayError::RegistryRace`]
    pub async fn acquire(
        &self,
        id: &SessionId,
        options: AcquireOptions<T>,
    ) -> Result<SessionHandle<T>> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let existing = self.inner.entries.get(id).await;
        if options.create_only
            && (existing.is_some() || self.inner.buffers.get(id).await.is_some())
        {
            tracing::debug!(session_id = %id, "Create rejected, id in use");
            return Err(RelayError::SessionExists(id.clone()));
        }

        if let Some(entry) = existing {
            let ref_count = self.inner.entries.update_ref_count(id, 1).await?;
            tracing::debug!(session_id = %id, ref_count, "Session acquired");
            return Ok(entry.handle);
        }

        if let Some(buffer) = self.inner.buffers.get(id).await {
            return Ok(self.adopt(id, buffer).await);
        }

        let Some(source) = options.source else {
            return Err(RelayError::MissingSource(id.clone()));
        };

        let buffer = self.inner.buffers.create(id).await?;
        let (status_tx, status_rx) = watch::channel(SessionStatus::Streaming);
        let handle = SessionHandle::new(id.clone(), Arc::clone(&buffer).into_log(), status_rx);

        self.spawn_writer(id, source, buffer, status_tx);
        self.inner
            .entries
            .set(id, SessionEntry::new(handle.clone()))
            .await;

        tracing::info!(session_id = %id, "Session created");
        Ok(handle)
    }

    /// Acquire a session and wrap the reference in a [`SessionLease`]
    ///
    /// # Errors
    ///
    /// See [`SessionRegistry::acquire`].
    pub async fn lease(
        &self,
        id: &SessionId,
        options: AcquireOptions<T>,
    ) -> Result<SessionLease<T>> {
        let handle = self.acquire(id, options).await?;
        let registry = self.clone();
        let release_id = id.clone();
        let release = async move { registry.release(&release_id).await }.boxed();
        Ok(SessionLease {
            handle,
            release: Some(release),
        })
    }

    /// Drop one reference to a session
    ///
    /// Unknown ids and releases past zero are ignored. When the last
    /// reference goes away the session is deleted, immediately if its writer
    /// has finished, otherwise once it does and only if nobody re-acquired it
    /// in the meantime.
    ///
    /// # Errors
    ///
    /// Store errors such as [`RelayError::RegistryRace`].
    pub async fn release(&self, id: &SessionId) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let Some(entry) = self.inner.entries.get(id).await else {
            tracing::debug!(session_id = %id, "Release of unknown session ignored");
            return Ok(());
        };
        if entry.ref_count == 0 {
            tracing::warn!(session_id = %id, "Release without matching acquire ignored");
            return Ok(());
        }

        let ref_count = self.inner.entries.update_ref_count(id, -1).await?;
        tracing::debug!(session_id = %id, ref_count, "Session released");
        if ref_count > 0 {
            return Ok(());
        }

        if entry.handle.status().is_streaming() {
            tracing::debug!(session_id = %id, "Deferring cleanup until writer finishes");
            self.spawn_cleanup_waiter(entry.handle);
        } else {
            self.delete_session(id).await;
        }
        Ok(())
    }

    /// Stop a session's producer
    ///
    /// The writer fails the buffer with [`RelayError::Aborted`]. Returns
    /// `false` if the session is unknown or its writer already finished.
    /// Unlike [`release`](Self::release), readers are affected: they see
    /// the abort error after the last token.
    pub async fn abort(&self, id: &SessionId) -> bool {
        let Some(entry) = self.inner.entries.get(id).await else {
            return false;
        };
        if !entry.handle.status().is_streaming() {
            return false;
        }
        match self.inner.writers.get(id) {
            Some(writer) if !writer.cancel.is_cancelled() => {
                writer.cancel.cancel();
                tracing::info!(session_id = %id, "Session aborted");
                true
            }
            _ => false,
        }
    }

    /// Abort every running writer and wait for all writer tasks to exit
    ///
    /// Entries stay registered so clients can still read what was written.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .writers
            .iter()
            .map(|writer| writer.key().clone())
            .collect();

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, writer)) = self.inner.writers.remove(&id) {
                writer.cancel.cancel();
                tasks.push(writer.task);
            }
        }

        let count = tasks.len();
        for result in future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Writer task did not exit cleanly");
            }
        }
        tracing::info!(writers = count, "Registry shut down");
    }

    /// Whether a session is registered
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.inner.entries.get(id).await.is_some()
    }

    /// Current ref count of a session
    pub async fn ref_count(&self, id: &SessionId) -> Option<u32> {
        self.inner.entries.get(id).await.map(|entry| entry.ref_count)
    }

    /// Handle of a registered session, without taking a reference
    pub async fn handle(&self, id: &SessionId) -> Option<SessionHandle<T>> {
        self.inner.entries.get(id).await.map(|entry| entry.handle)
    }

    /// Ids of all registered sessions, sorted
    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids = self.inner.entries.ids().await;
        ids.sort();
        ids
    }

    /// Snapshot of one session
    pub async fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        let entry = self.inner.entries.get(id).await?;
        let buffer = entry.handle.buffer();
        Some(SessionInfo {
            session_id: id.clone(),
            status: entry.handle.status(),
            lsn: buffer.len().await,
            ref_count: entry.ref_count,
            created_at: entry.created_at,
            error: buffer.error().await.map(|e| e.to_string()),
        })
    }

    /// Counts across all sessions
    pub async fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for id in self.inner.entries.ids().await {
            let Some(entry) = self.inner.entries.get(&id).await else {
                continue;
            };
            summary.total_sessions += 1;
            summary.total_refs += u64::from(entry.ref_count);
            *summary
                .by_status
                .entry(entry.handle.status().name().to_string())
                .or_insert(0) += 1;
        }
        summary
    }

    /// Register a buffer found without an entry
    ///
    /// No writer is started; the status comes from the buffer's own state.
    async fn adopt(&self, id: &SessionId, buffer: SharedBuffer<T>) -> SessionHandle<T> {
        let status = match buffer.error().await {
            Some(error) => writer::status_for_error(&error),
            None if buffer.is_complete().await => SessionStatus::Complete,
            None => SessionStatus::Orphaned,
        };
        let (_, status_rx) = watch::channel(status);
        let handle = SessionHandle::new(id.clone(), buffer.into_log(), status_rx);
        self.inner
            .entries
            .set(id, SessionEntry::new(handle.clone()))
            .await;

        tracing::info!(session_id = %id, status = %status, "Adopted buffer without registry entry");
        handle
    }

    fn spawn_writer(
        &self,
        id: &SessionId,
        source: TokenSource<T>,
        buffer: SharedBuffer<T>,
        status: watch::Sender<SessionStatus>,
    ) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            writer::run_writer(
                source,
                buffer,
                self.inner.config.idle_timeout,
                cancel.clone(),
                status,
            )
            .instrument(tracing::info_span!("writer", session_id = %id)),
        );
        self.inner
            .writers
            .insert(id.clone(), WriterHandle { cancel, task });
    }

    fn spawn_cleanup_waiter(&self, handle: SessionHandle<T>) {
        let registry = self.clone();
        let span = tracing::info_span!("cleanup", session_id = %handle.id());

        tokio::spawn(
            async move {
                let status = handle.wait_until_settled().await;
                let id = handle.id();
                let _lifecycle = registry.inner.lifecycle.lock().await;

                match registry.inner.entries.get(id).await {
                    Some(entry) if entry.handle.same_session(&handle) && entry.ref_count == 0 => {
                        tracing::debug!(status = %status, "Writer settled, cleaning up");
                        registry.delete_session(id).await;
                    }
                    Some(entry) => {
                        tracing::debug!(
                            ref_count = entry.ref_count,
                            "Session re-acquired before cleanup, keeping it"
                        );
                    }
                    None => tracing::debug!("Session already deleted"),
                }
            }
            .instrument(span),
        );
    }

    /// Remove entry, buffer, and writer bookkeeping; caller holds the lifecycle lock
    async fn delete_session(&self, id: &SessionId) {
        self.inner.entries.delete(id).await;
        self.inner.buffers.delete(id).await;
        if let Some((_, writer)) = self.inner.writers.remove(id) {
            writer.cancel.cancel();
        }
        tracing::info!(session_id = %id, "Session deleted");
    }
}

/// One counted reference to a session
///
/// Releases itself when dropped, so a reference tied to a connection goes
/// away with the connection. Dropping outside a Tokio runtime leaks the
/// reference; call [`SessionLease::release`] there instead.
pub struct SessionLease<T> {
    handle: SessionHandle<T>,
    release: Option<BoxFuture<'static, Result<()>>>,
}

impl<T> SessionLease<T> {
    /// The leased session
    #[must_use]
    pub fn handle(&self) -> &SessionHandle<T> {
        &self.handle
    }

    /// The leased session's id
    #[must_use]
    pub fn id(&self) -> &SessionId {
        self.handle.id()
    }

    /// Release now and wait for the registry to process it
    ///
    /// # Errors
    ///
    /// See [`SessionRegistry::release`].
    pub async fn release(mut self) -> Result<()> {
        match self.release.take() {
            Some(release) => release.await,
            None => Ok(()),
        }
    }
}

impl<T> Drop for SessionLease<T> {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let session_id = self.handle.id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = release.await {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %e,
                            "Lease release failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session_id,
                    "Lease dropped outside a runtime, reference leaked"
                );
            }
        }
    }
}

impl<T> fmt::Debug for SessionLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("handle", &self.handle)
            .field("released", &self.release.is_none())
            .finish()
    }
}
