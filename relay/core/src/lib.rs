//! Relay Core - Durable Token Streaming
//!
//! This crate streams incrementally produced tokens (e.g. LLM output) from a
//! single producer to any number of independent consumers that may disconnect
//! and come back. The producer's lifetime is decoupled from every consumer's
//! connection.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   acquire(id, source)   ┌───────────────────────────────┐
//! │    Client     │ ──────────────────────> │        SessionRegistry        │
//! │ (HTTP, test)  │ <────── handle ──────── │  ref counts · deferred cleanup│
//! └──────┬────────┘                         └──────┬────────────────────────┘
//!        │ pull_stream(buffer, lsn)                │ spawns
//!        ▼                                         ▼
//! ┌───────────────┐      read / wait        ┌───────────────┐     drain     ┌──────────┐
//! │  PullStream   │ ──────────────────────> │  TokenBuffer  │ <──────────── │  Writer  │ <── src
//! └──────┬────────┘                         └───────────────┘               └──────────┘
//!        │
//!        ▼
//! ┌───────────────┐
//! │ NdjsonBridge  │ ──> {"token":"…","lsn":n}\n
//! └───────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`SessionRegistry`]: Acquire/release sessions, owns writer tasks
//! - [`TokenBuffer`]: Append-only per-session log addressed by LSN, writer side
//! - [`TokenLog`]: Read-only view of the same log, all a handle exposes
//! - [`PullStream`]: One consumer's cursor over a buffer
//! - [`NdjsonBridge`]: A reader as a byte stream for HTTP bodies
//! - [`ResumableReader`]: HTTP client that reconnects from its last LSN
//!
//! # Quick Start
//!
//! ```ignore
//! use futures::StreamExt;
//! use relay_core::{
//!     backend::source_from_iter, pull_stream, AcquireOptions, RegistryConfig,
//!     SessionId, SessionRegistry,
//! };
//!
//! let registry = SessionRegistry::new(RegistryConfig::default());
//! let id = SessionId::from("s1");
//! let source = source_from_iter(vec!["Hello".to_string(), " world".to_string()]);
//! let handle = registry.acquire(&id, AcquireOptions::with_source(source)).await?;
//!
//! let mut frames = pull_stream(handle.buffer().clone(), 0);
//! while let Some(frame) = frames.next().await {
//!     let frame = frame?;
//!     println!("{} {}", frame.lsn, frame.token);
//! }
//! registry.release(&id).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Producer contract and the Ollama producer
//! - [`buffer`]: Token buffers and their store
//! - [`client`]: Resumable HTTP reader
//! - [`config`]: TOML/env configuration
//! - [`error`]: Shared error type
//! - [`registry`]: Session registry, registry store, writer task
//! - [`session`]: Session ids, status, handles
//! - [`streaming`]: Pull-based readers
//! - [`transport`]: NDJSON framing and the pull-to-push bridge

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod session;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use backend::{LlmBackend, LlmRequest, OllamaBackend, TokenSource};
pub use buffer::{
    Lsn, MemoryTokenBuffer, MemoryTokenBufferStore, ReadResult, SharedBuffer, SharedLog,
    TokenBuffer, TokenBufferStore, TokenLog,
};
pub use client::{ClientConfig, ResumableReader};
pub use error::{RelayError, Result};
pub use registry::{
    drain_into, AcquireOptions, MemorySessionStore, RegistryConfig, RegistrySummary,
    SessionLease, SessionRegistry, SessionRegistryStore,
};
pub use session::{SessionEntry, SessionHandle, SessionId, SessionInfo, SessionStatus};
pub use streaming::{pull_stream, PullStream, StreamFrame};
pub use transport::{NdjsonBridge, NDJSON_CONTENT_TYPE};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, RelayToml,
};
