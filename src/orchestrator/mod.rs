//! Session orchestration modules.
//!
//! Covers the logical-session registry, prompt context augmentation, and
//! prompt dispatch with streamed updates.

pub mod context;
pub mod prompt;
pub mod session_manager;
