#![forbid(unsafe_code)]

//! Agent Client Protocol session engine.
//!
//! Spawns ACP agents as subprocesses, performs the `initialize` handshake
//! with bounded retries, multiplexes logical sessions onto independent
//! connections, and relays streamed `session/update` notifications back to
//! the prompt that caused them.

pub mod acp;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
