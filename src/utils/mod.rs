//! Utility functions.

pub mod bootstrap;

pub use bootstrap::init_tracing;
