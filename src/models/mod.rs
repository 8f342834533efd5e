//! Domain model module declarations.

pub mod prompt;
pub mod session;
