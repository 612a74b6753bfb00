//! Error types for the Tickflow library.
//!
//! Step failures never travel through this type: they are reported through
//! `Status::Error` and the lifecycle events. `TickflowError` covers the
//! host-facing faults: configuration loading and typed argument lookups.

use thiserror::Error;

/// Convenience alias used across the library.
pub type Result<T> = std::result::Result<T, TickflowError>;

#[derive(Debug, Error)]
pub enum TickflowError {
    #[error("task argument '{key}' is not set")]
    MissingArg { key: String },

    #[error("task argument '{key}' is not a {expected}")]
    ArgType { key: String, expected: &'static str },

    #[error("custom clock resolution needs at least one tick per second")]
    InvalidTickRate,

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}
