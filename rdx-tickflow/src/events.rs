//! Defines all public event types broadcast by Tickflow components.
//!
//! Events are fire-and-forget: each component owns a `broadcast` sender and a
//! send with no subscribers is silently dropped. Hosts subscribe to the streams
//! they care about and drain them between ticks.

use crate::common::PathId;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Lifecycle notifications of a single `ContinuationPath`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    /// The front step was consumed and more steps remain.
    Advanced,
    /// The queue became empty, for any reason.
    Finished,
    /// The queue became empty without an error during this update.
    Succeeded,
    /// A step reported `Status::Error`; the path has been cleared.
    Errored,
}

/// Lifecycle notifications of entries in a `TaskTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A new entry was registered under `key`.
    Scheduled { key: String },
    /// The entry's action ran; `invocation` counts from 1.
    Fired { key: String, invocation: u64 },
    /// The entry resolved to `Status::Ok` and was reaped.
    Completed { key: String },
    /// The entry resolved to `Status::Error` and was reaped.
    Failed { key: String, reason: Option<String> },
    /// The entry was removed by `TaskTable::remove` before resolving.
    Cancelled { key: String },
}

/// Events related to the lifecycle and state of the engine itself.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Fired once when the engine's `run` loop begins.
    EngineStarted { timestamp: Instant },
    /// Fired once when the engine's `run` loop is about to exit.
    EngineShutdown,
    /// Fired when a path is handed to the engine.
    PathAdded { id: PathId },
    /// Fired when a hosted path drained (or was removed) and left the engine.
    PathRetired { id: PathId, succeeded: bool },
    /// Fired after every engine tick.
    TickCompleted {
        tick_count: u64,
        wall_clock: DateTime<Utc>,
    },
}
