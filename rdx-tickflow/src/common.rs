//! Contains common, primitive types shared by every Tickflow component.
//!
//! `Status` is the result vocabulary returned by every step, task action and
//! branch wrapper. The ID types identify paths hosted by the engine. Using
//! distinct types improves type safety and code clarity.

use serde::Deserialize;
use slotmap::new_key_type;
use std::sync::{Mutex, MutexGuard, PoisonError};

new_key_type! {
    /// Uniquely and safely identifies a `ContinuationPath` hosted by the engine.
    ///
    /// This key is returned by `TickflowEngine::spawn_path`. It is never reused
    /// for a different path, so a stale ID simply stops resolving once the path
    /// has been retired.
    pub struct PathId;
}

/// The outcome a step or task action reports back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The step is done; advance to the next one on the following tick.
    Ok,
    /// Abort. A path is cleared entirely; a named task is reaped.
    Error,
    /// Not done yet; invoke again next tick.
    Continue,
    /// A named task still counting down its delay.
    Wait,
    /// The step is done; advance and invoke the next step in the same tick.
    Immediate,
}

impl Status {
    /// Returns `true` for the two statuses that end a named task.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Ok | Status::Error)
    }

    /// Returns `true` if the step should be invoked again on a later tick.
    pub fn is_pending(self) -> bool {
        matches!(self, Status::Continue | Status::Wait)
    }
}

/// Acquires a component lock, recovering the data if a previous holder panicked.
///
/// Callbacks never run while a component lock is held, so a poisoned lock can
/// only come from a panic inside the component's own bookkeeping.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generates a process-unique key for unnamed tasks and wait locks.
pub(crate) fn unique_key() -> String {
    uuid::Uuid::new_v4().to_string()
}
