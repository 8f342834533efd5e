//! Agent Client Protocol (ACP) stream handling.
//!
//! This module manages JSON-RPC 2.0 communication with agent processes over
//! their stdio. Each [`connection::AcpConnection`] owns at most one process
//! and a reader/writer task pair attached to it.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing
//!   with multi-line and concatenated document support.
//! - `message`: JSON-RPC message model and classification.
//! - `protocol`: ACP method names and payload types.
//! - `spawner`: launch command construction and process spawning.
//! - `handshake`: `initialize` payload, retry backoff, setting capabilities.
//! - `state`: connection lifecycle state machine.
//! - `reader` / `writer`: per-process I/O tasks.
//! - `connection`: request correlation, dispatch, and exit handling.

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod message;
pub mod protocol;
pub mod reader;
pub mod spawner;
pub mod state;
pub mod writer;
