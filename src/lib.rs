//! chordcast: per-chat playback engine for group voice conferences.
//!
//! Each group chat gets a queue, a long-lived user session (assistant) that
//! attends the voice conference on the bot's behalf, and a coordinator that
//! resolves media from external catalogs, materializes it on disk, and
//! pushes it into the native call engine. The chat-protocol binding and the
//! native engine itself stay behind the traits in [`gateway`] and
//! [`engine`]; everything above them lives here.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod provider;
pub mod queue;
pub mod repository;
pub mod service;

pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
