//! Transport Layer
//!
//! Turns readers into bytes a push-style transport can forward.
//!
//! - [`frame`]: NDJSON encoding and an incremental line decoder
//! - [`NdjsonBridge`]: a reader exposed as a `Stream` of `Bytes` chunks
//!
//! # Design Philosophy
//!
//! The transport layer knows nothing about sessions or ref counts. It drives a
//! [`PullStream`](crate::streaming::PullStream) when the transport asks for
//! more, so a slow HTTP client applies backpressure to its own reader only.

mod bridge;
pub mod frame;

pub use bridge::{NdjsonBridge, NDJSON_CONTENT_TYPE};
pub use frame::{encode_frame, encode_line, NdjsonDecoder, MAX_FRAME_SIZE};
