//! Relay Daemon library
//!
//! The HTTP surface of `relay-daemon`, exposed as a library so the router can
//! be exercised in-process by tests and embedded by other binaries.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod server;

pub use server::{build_app, ApiError, AppState};
