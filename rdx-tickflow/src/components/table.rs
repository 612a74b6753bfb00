//! The named task table: a keyed registry of deferred and periodic tasks.
//!
//! Entries are addressed by string key and polled once per tick. A path waits
//! on the table purely through `exists`, which makes "is this lock gone yet?"
//! the only contract between the two.

use crate::common::{lock, unique_key, Status};
use crate::components::task::{NamedTask, Repeat, TaskArgs, TaskState};
use crate::events::TaskEvent;
use indexmap::IndexMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, trace};

/// Outcome of `TaskTable::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The task was stored under this key.
    Registered(String),
    /// The key was already taken; the existing entry was left untouched.
    AlreadyPresent(String),
}

impl AddOutcome {
    pub fn key(&self) -> &str {
        match self {
            AddOutcome::Registered(key) | AddOutcome::AlreadyPresent(key) => key,
        }
    }

    pub fn into_key(self) -> String {
        match self {
            AddOutcome::Registered(key) | AddOutcome::AlreadyPresent(key) => key,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, AddOutcome::Registered(_))
    }
}

// An entry is checked out of its slot while its action runs so the action may
// call back into the table.
enum Slot {
    Idle(NamedTask),
    Busy { cancelled: bool },
}

impl Slot {
    fn is_live(&self) -> bool {
        !matches!(self, Slot::Busy { cancelled: true })
    }
}

#[derive(Default)]
struct TableInner {
    slots: IndexMap<String, Slot>,
}

/// A shared handle to a table of named tasks.
///
/// Cloning the handle is cheap; all clones see the same entries.
#[derive(Clone)]
pub struct TaskTable {
    inner: Arc<Mutex<TableInner>>,
    task_event_sender: broadcast::Sender<TaskEvent>,
}

impl TaskTable {
    pub fn new() -> Self {
        let (task_event_sender, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(TableInner::default())),
            task_event_sender,
        }
    }

    /// Registers `task` under `key`. The first registration of a key wins;
    /// later ones are ignored. An empty key is replaced by a generated one.
    pub fn add(&self, key: impl Into<String>, task: NamedTask) -> AddOutcome {
        let mut key = key.into();
        if key.is_empty() {
            key = unique_key();
        }

        let mut inner = lock(&self.inner);
        match inner.slots.get_mut(&key) {
            Some(slot) if slot.is_live() => {
                trace!(%key, "task already registered, ignoring");
                return AddOutcome::AlreadyPresent(key);
            }
            // Re-registered while the cancelled entry's action is still running.
            Some(slot) => *slot = Slot::Idle(task),
            None => {
                inner.slots.insert(key.clone(), Slot::Idle(task));
            }
        }
        drop(inner);

        debug!(%key, "task scheduled");
        self.task_event_sender
            .send(TaskEvent::Scheduled { key: key.clone() })
            .ok();
        AddOutcome::Registered(key)
    }

    /// Registers a one-shot action that fires on the next update.
    pub fn add_action(
        &self,
        key: impl Into<String>,
        action: impl FnMut(&mut TaskState) -> Status + Send + 'static,
    ) -> AddOutcome {
        self.add(key, NamedTask::new(action))
    }

    pub fn add_action_with_args(
        &self,
        key: impl Into<String>,
        action: impl FnMut(&mut TaskState) -> Status + Send + 'static,
        args: TaskArgs,
    ) -> AddOutcome {
        self.add(key, NamedTask::new(action).with_args(args))
    }

    pub fn add_periodic(
        &self,
        key: impl Into<String>,
        action: impl FnMut(&mut TaskState) -> Status + Send + 'static,
        period: Duration,
        repeat: Repeat,
    ) -> AddOutcome {
        self.add(key, NamedTask::periodic(action, period, repeat))
    }

    pub fn add_periodic_with_args(
        &self,
        key: impl Into<String>,
        action: impl FnMut(&mut TaskState) -> Status + Send + 'static,
        period: Duration,
        repeat: Repeat,
        args: TaskArgs,
    ) -> AddOutcome {
        self.add(key, NamedTask::periodic(action, period, repeat).with_args(args))
    }

    /// Ensures an entry named `key` exists for at least `duration`.
    pub fn add_wait_lock(&self, key: impl Into<String>, duration: Duration) -> AddOutcome {
        self.add(key, NamedTask::wait_lock(duration))
    }

    pub fn exists(&self, key: &str) -> bool {
        lock(&self.inner)
            .slots
            .get(key)
            .is_some_and(Slot::is_live)
    }

    /// Removes `key` without running it again. Returns `true` if it was live.
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = lock(&self.inner);
        let removed = match inner.slots.get(key) {
            Some(Slot::Idle(_)) => inner.slots.shift_remove(key).is_some(),
            Some(Slot::Busy { cancelled: false }) => {
                inner
                    .slots
                    .insert(key.to_string(), Slot::Busy { cancelled: true });
                true
            }
            _ => false,
        };
        drop(inner);

        if removed {
            debug!(%key, "task cancelled");
            self.task_event_sender
                .send(TaskEvent::Cancelled {
                    key: key.to_string(),
                })
                .ok();
        }
        removed
    }

    pub fn clear(&self) {
        lock(&self.inner).slots.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner)
            .slots
            .values()
            .filter(|slot| slot.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys in registration order.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner)
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Reads the state of an idle entry. Returns `None` if `key` is unknown or
    /// its action is running right now.
    pub fn inspect<R>(&self, key: &str, f: impl FnOnce(&TaskState) -> R) -> Option<R> {
        match lock(&self.inner).slots.get(key)? {
            Slot::Idle(task) => Some(f(task.state())),
            Slot::Busy { .. } => None,
        }
    }

    /// Subscribes to the `TaskEvent` stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.task_event_sender.subscribe()
    }

    /// Advances every entry by `delta` in registration order and reaps the ones
    /// that resolved to `Ok` or `Error`. Returns how many were reaped.
    ///
    /// Entries registered by an action during this call are first updated on
    /// the next call.
    pub fn update(&self, delta: Duration) -> usize {
        let delta = delta.as_secs_f64();
        let keys: Vec<String> = lock(&self.inner).slots.keys().cloned().collect();
        let mut reaped = 0;

        for key in keys {
            let Some(mut task) = self.check_out(&key) else {
                continue;
            };
            let guard = CheckoutGuard { table: self, key: &key };
            let fired_before = task.state().invocations();
            let status = task.update(delta);
            drop(guard);
            if task.state().invocations() > fired_before {
                self.task_event_sender
                    .send(TaskEvent::Fired {
                        key: key.clone(),
                        invocation: task.state().invocations(),
                    })
                    .ok();
            }
            if self.check_in(key, task, status) {
                reaped += 1;
            }
        }
        reaped
    }

    fn check_out(&self, key: &str) -> Option<NamedTask> {
        let mut inner = lock(&self.inner);
        let slot = inner.slots.get_mut(key)?;
        match mem::replace(slot, Slot::Busy { cancelled: false }) {
            Slot::Idle(task) => Some(task),
            busy => {
                *slot = busy;
                None
            }
        }
    }

    /// Puts `task` back into its slot, or drops it. Returns `true` if it was reaped.
    fn check_in(&self, key: String, task: NamedTask, status: Status) -> bool {
        let mut inner = lock(&self.inner);
        match inner.slots.get_mut(&key) {
            Some(Slot::Busy { cancelled: false }) => {
                if !status.is_terminal() {
                    inner.slots.insert(key, Slot::Idle(task));
                    return false;
                }
                inner.slots.shift_remove(&key);
            }
            Some(Slot::Busy { cancelled: true }) => {
                inner.slots.shift_remove(&key);
                return false;
            }
            // Cleared, or cancelled and registered again while running.
            _ => return false,
        }
        drop(inner);

        let event = if status == Status::Ok {
            debug!(%key, "task completed");
            TaskEvent::Completed { key }
        } else {
            let reason = task.state().failure().map(str::to_string);
            debug!(%key, ?reason, "task failed");
            TaskEvent::Failed { key, reason }
        };
        self.task_event_sender.send(event).ok();
        true
    }
}

// Drops the slot of an entry whose action unwinds before it is checked back in,
// so the key does not stay busy forever.
struct CheckoutGuard<'a> {
    table: &'a TaskTable,
    key: &'a str,
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let mut inner = lock(&self.table.inner);
        if !matches!(inner.slots.get(self.key), Some(Slot::Busy { .. })) {
            return;
        }
        inner.slots.shift_remove(self.key);
        drop(inner);

        error!(key = %self.key, "task action panicked, dropping the entry");
        self.table
            .task_event_sender
            .send(TaskEvent::Failed {
                key: self.key.to_string(),
                reason: Some("action panicked".to_string()),
            })
            .ok();
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTable")
            .field("keys", &self.keys())
            .finish()
    }
}
