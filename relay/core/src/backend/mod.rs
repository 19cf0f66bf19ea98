//! Token Producers
//!
//! Everything that can feed a session: the [`TokenSource`] contract, small
//! adapters for iterators and channels, and LLM backends.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{LlmBackend, LlmRequest, OllamaBackend};
//!
//! let backend = OllamaBackend::new("localhost", 11434);
//! let source = backend.stream_tokens(&LlmRequest::new("Hello!", "llama3.2")).await?;
//! registry.acquire(&id, AcquireOptions::with_source(source)).await?;
//! ```

mod ollama;
mod traits;

pub use ollama::OllamaBackend;
pub use traits::{
    source_from_channel, source_from_iter, source_from_results, LlmBackend, LlmRequest,
    ModelInfo, TokenSource,
};
