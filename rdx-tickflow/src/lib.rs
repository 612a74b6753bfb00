//! # Tickflow
//!
//! A cooperative, poll-driven task sequencing engine for Rust.
//!
//! Tickflow is advanced once per external tick (a game loop, a frame timer, a
//! fixed-rate clock) instead of by threads. Work is expressed as small closures
//! that report a `Status`; "waiting" simply means asking to be polled again on
//! the next tick.
//!
//! ## Core Concepts
//!
//! - **ContinuationPath**: An ordered queue of steps. Only the front step runs;
//!   it decides whether the path advances (`Ok`), hands over within the same
//!   tick (`Immediate`), retries next tick (`Continue`) or aborts (`Error`).
//!   Paths nest through `branch` and pause through `wait`.
//! - **TaskTable**: Named, independently-timed tasks addressed by string key.
//!   Delayed one-shots, periodic jobs with a repeat budget, and the wait locks
//!   that back `ContinuationPath::wait`.
//! - **TimedQueue**: A FIFO of plain callbacks, immediate, delayed or repeating,
//!   drained with a per-tick bound.
//! - **TickflowEngine**: The context handle owning one of each, hosting spawned
//!   paths and driving everything from `tick` or its own clock.
//!
//! ## Example Usage
//!
//! ```rust
//! use tickflow::prelude::*;
//! use std::time::Duration;
//!
//! let engine = TickflowEngine::new(TickflowConfig::default());
//!
//! let mut path = engine.path();
//! path.add(|| Status::Ok)
//!     .wait(engine.tasks(), Duration::from_millis(100))
//!     .add(|| Status::Ok);
//! let id = engine.spawn_path(path);
//!
//! let frame = Duration::from_millis(16);
//! while engine.has_path(id) {
//!     engine.tick(frame);
//! }
//! assert!(engine.tick_count() >= 7);
//! ```

pub const ENGINE_NAME: &str = "Tickflow Engine";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod time;

/// A prelude module for easy importing of the most common Tickflow types.
pub mod prelude {
    pub use crate::common::{PathId, Status};
    pub use crate::components::path::{path_step, step, BoxedStep, ContinuationPath, PathTick, Plain, Step};
    pub use crate::components::queue::TimedQueue;
    pub use crate::components::table::{AddOutcome, TaskTable};
    pub use crate::components::task::{NamedTask, Repeat, TaskArgs, TaskState};
    pub use crate::config::{ClockResolution, TickflowConfig};
    pub use crate::engine::{TickReport, TickflowEngine};
    pub use crate::error::TickflowError;
    pub use crate::events::{PathEvent, SystemEvent, TaskEvent};
}
