//! Defines named, independently-timed tasks and the state they carry.
//!
//! A `NamedTask` pairs an action with a `TaskState`: a countdown, monotonic
//! counters and a typed argument bag. One-shot tasks fire once their delay has
//! elapsed; periodic tasks re-arm themselves according to a `Repeat` budget.

use crate::common::Status;
use crate::error::{Result, TickflowError};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// The argument key `TaskState::fail` stores its message under.
pub const ERROR_ARG: &str = "ERR";

/// A function closure invoked once a task's delay has elapsed.
pub type TaskAction = Box<dyn FnMut(&mut TaskState) -> Status + Send>;

/// Defines the repetition budget of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// The task fires this many times and then completes.
    /// `Times(0)` behaves like `Times(1)`.
    Times(u32),
    /// The task re-arms indefinitely.
    Forever,
}

/// A typed, string-keyed bag of caller state attached to a task.
///
/// Lookups never panic: `get` returns `None` for a missing key or a value of
/// another type, `require` reports which of the two happened, and `get_or`
/// falls back to a caller-supplied default.
#[derive(Default)]
pub struct TaskArgs {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `set`.
    pub fn with<T: Any + Send>(mut self, key: impl Into<String>, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn set<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut::<T>()
    }

    /// Returns a copy of the value under `key`, or `default` if it is absent
    /// or holds another type.
    pub fn get_or<T: Any + Clone>(&self, key: &str, default: T) -> T {
        self.get::<T>(key).cloned().unwrap_or(default)
    }

    /// Looks up a value that must be present.
    pub fn require<T: Any>(&self, key: &str) -> Result<&T> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| TickflowError::MissingArg {
                key: key.to_string(),
            })?;
        value
            .downcast_ref::<T>()
            .ok_or_else(|| TickflowError::ArgType {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Removes `key`, returning `true` if it was set.
    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for TaskArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// The mutable state a task's action sees on every invocation.
#[derive(Debug)]
pub struct TaskState {
    status: Status,
    delay: f64,
    age: f64,
    invocations: u64,
    args: TaskArgs,
}

impl TaskState {
    fn new(delay: f64, args: TaskArgs) -> Self {
        Self {
            status: Status::Wait,
            delay,
            age: 0.0,
            invocations: 0,
            args,
        }
    }

    /// The status the task resolved to on its last update.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Seconds left before the action fires. Zero or negative once due.
    pub fn remaining_secs(&self) -> f64 {
        self.delay
    }

    /// Seconds of ticks this task has lived through since registration,
    /// whether or not its action ran on them.
    pub fn age_secs(&self) -> f64 {
        self.age
    }

    /// How many times the action has been invoked, including the current call.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn args(&self) -> &TaskArgs {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut TaskArgs {
        &mut self.args
    }

    /// Resolves the task successfully.
    pub fn ok(&mut self) -> Status {
        Status::Ok
    }

    /// Keeps the task alive; a one-shot task is invoked again next tick.
    pub fn proceed(&mut self) -> Status {
        Status::Continue
    }

    /// Resolves the task as failed, keeping `message` under `ERROR_ARG`.
    pub fn fail(&mut self, message: impl Into<String>) -> Status {
        self.args.set(ERROR_ARG, message.into());
        Status::Error
    }

    /// Puts a one-shot task back to sleep for `delay` before its next invocation.
    pub fn sleep(&mut self, delay: Duration) -> Status {
        self.delay = delay.as_secs_f64();
        Status::Wait
    }

    /// The message stored by `fail`, if any.
    pub fn failure(&self) -> Option<&str> {
        self.args.get::<String>(ERROR_ARG).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Once,
    Periodic { period: f64, budget: Repeat },
}

/// A deferred or periodic unit of work registered in a `TaskTable`.
pub struct NamedTask {
    state: TaskState,
    action: TaskAction,
    schedule: Schedule,
}

impl NamedTask {
    /// A task that fires on the first update after registration.
    pub fn new(action: impl FnMut(&mut TaskState) -> Status + Send + 'static) -> Self {
        Self::delayed(action, Duration::ZERO)
    }

    /// A task that fires once `delay` has elapsed.
    pub fn delayed(
        action: impl FnMut(&mut TaskState) -> Status + Send + 'static,
        delay: Duration,
    ) -> Self {
        Self {
            state: TaskState::new(delay.as_secs_f64(), TaskArgs::new()),
            action: Box::new(action),
            schedule: Schedule::Once,
        }
    }

    /// A task that fires every `period`, `repeat` times.
    ///
    /// Each invocation that returns `Status::Continue` spends one unit of the
    /// budget and re-arms the task. Returning `Ok` or `Error` ends it early.
    pub fn periodic(
        action: impl FnMut(&mut TaskState) -> Status + Send + 'static,
        period: Duration,
        repeat: Repeat,
    ) -> Self {
        let period = period.as_secs_f64();
        Self {
            state: TaskState::new(period, TaskArgs::new()),
            action: Box::new(action),
            schedule: Schedule::Periodic {
                period,
                budget: repeat,
            },
        }
    }

    /// A task that does nothing but exist for `duration`.
    pub fn wait_lock(duration: Duration) -> Self {
        Self::delayed(|_| Status::Ok, duration)
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.state.args = args;
        self
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Advances the task by `delta` seconds, invoking its action if it is due.
    pub(crate) fn update(&mut self, delta: f64) -> Status {
        let state = &mut self.state;
        state.age += delta;
        if state.status == Status::Wait {
            if state.delay > 0.0 {
                state.delay -= delta;
            }
            if state.delay <= 0.0 {
                state.status = Status::Continue;
            }
        }
        if state.status != Status::Continue {
            return state.status;
        }

        state.invocations += 1;
        let status = (self.action)(&mut self.state);
        self.state.status = status;

        if let Schedule::Periodic { period, budget } = &mut self.schedule {
            if status == Status::Continue {
                let next = match budget {
                    Repeat::Forever => Status::Wait,
                    Repeat::Times(left) => {
                        *left = left.saturating_sub(1);
                        if *left > 0 {
                            Status::Wait
                        } else {
                            Status::Ok
                        }
                    }
                };
                self.state.delay = *period;
                self.state.status = next;
            }
        }
        self.state.status
    }
}

impl fmt::Debug for NamedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedTask")
            .field("state", &self.state)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}
