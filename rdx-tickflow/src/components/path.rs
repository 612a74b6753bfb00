//! Continuation paths: ordered queues of steps advanced one at a time per tick.
//!
//! Only the front step of a path is ever invoked. Its returned `Status` decides
//! whether the path advances, keeps retrying the same step, or aborts. Branches
//! nest a whole sub-path behind a single step, and `wait` builds such a branch
//! around a lock in the `TaskTable`.

use crate::common::{unique_key, Status};
use crate::components::table::TaskTable;
use crate::config::DEFAULT_IMMEDIATE_CHAIN;
use crate::events::PathEvent;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// A unit of work in a `ContinuationPath`.
///
/// Any `FnMut(&mut ContinuationPath) -> Status` closure is a step. Closures
/// that do not need the path are adapted with `Plain` (or added with
/// `ContinuationPath::add`).
pub trait Step: Send {
    fn invoke(&mut self, path: &mut ContinuationPath) -> Status;
}

impl<F> Step for F
where
    F: FnMut(&mut ContinuationPath) -> Status + Send,
{
    fn invoke(&mut self, path: &mut ContinuationPath) -> Status {
        self(path)
    }
}

/// Adapts an argument-less closure into a `Step` that ignores its path.
pub struct Plain<F>(pub F);

impl<F> Step for Plain<F>
where
    F: FnMut() -> Status + Send,
{
    fn invoke(&mut self, _path: &mut ContinuationPath) -> Status {
        (self.0)()
    }
}

pub type BoxedStep = Box<dyn Step>;

/// A function closure run by `wait` before or after the pause.
pub type Action = Box<dyn FnMut() + Send>;

/// Boxes an argument-less closure as a step, for use with `add_all` and `branch_steps`.
pub fn step(f: impl FnMut() -> Status + Send + 'static) -> BoxedStep {
    Box::new(Plain(f))
}

/// Boxes a path-aware closure as a step.
pub fn path_step(f: impl FnMut(&mut ContinuationPath) -> Status + Send + 'static) -> BoxedStep {
    Box::new(f)
}

/// What happened during one `ContinuationPath::update` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathTick {
    /// Steps invoked, counting every `Immediate` hand-off.
    pub steps_run: usize,
    /// Status returned by the last step invoked.
    pub last_status: Option<Status>,
    /// A step returned `Status::Error` and the path was cleared.
    pub errored: bool,
    /// The path held steps before the call and is empty after it.
    pub drained: bool,
    /// The `Immediate` chain hit its bound; the rest runs next tick.
    pub chain_limited: bool,
}

/// An ordered queue of steps advanced one at a time by `update`.
///
/// Every builder method returns `&mut Self` so calls can be chained:
///
/// ```
/// use tickflow::prelude::*;
///
/// let mut path = ContinuationPath::new();
/// path.add(|| Status::Immediate).add(|| Status::Ok);
/// assert_eq!(path.len(), 2);
/// path.update();
/// assert!(path.is_empty());
/// ```
pub struct ContinuationPath {
    steps: VecDeque<BoxedStep>,
    path_event_sender: Option<broadcast::Sender<PathEvent>>,
    max_immediate_chain: usize,
    // The front step is checked out of `steps` while it runs.
    running: bool,
    // `next` or `stop` was called by the running step.
    interrupted: bool,
    stopped: bool,
}

impl ContinuationPath {
    pub fn new() -> Self {
        Self::with_immediate_limit(DEFAULT_IMMEDIATE_CHAIN)
    }

    /// Creates a path that chains at most `limit` `Immediate` hand-offs per update.
    pub fn with_immediate_limit(limit: usize) -> Self {
        Self {
            steps: VecDeque::new(),
            path_event_sender: None,
            max_immediate_chain: limit,
            running: false,
            interrupted: false,
            stopped: false,
        }
    }

    /// Number of queued steps, not counting one that is currently running.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Subscribes to this path's `PathEvent` stream.
    pub fn subscribe(&mut self) -> broadcast::Receiver<PathEvent> {
        self.path_event_sender
            .get_or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    /// Appends an argument-less step.
    pub fn add(&mut self, f: impl FnMut() -> Status + Send + 'static) -> &mut Self {
        self.add_step(Plain(f))
    }

    /// Appends a step that receives the path it runs in.
    pub fn add_with_path(
        &mut self,
        f: impl FnMut(&mut ContinuationPath) -> Status + Send + 'static,
    ) -> &mut Self {
        self.add_step(f)
    }

    pub fn add_step(&mut self, step: impl Step + 'static) -> &mut Self {
        self.steps.push_back(Box::new(step));
        self
    }

    /// Appends a batch of steps in order.
    pub fn add_all(&mut self, steps: impl IntoIterator<Item = BoxedStep>) -> &mut Self {
        self.steps.extend(steps);
        self
    }

    /// Inserts an argument-less step at `position` (0 is the front).
    pub fn insert(&mut self, f: impl FnMut() -> Status + Send + 'static, position: usize) -> &mut Self {
        self.insert_boxed(Box::new(Plain(f)), position)
    }

    pub fn insert_with_path(
        &mut self,
        f: impl FnMut(&mut ContinuationPath) -> Status + Send + 'static,
        position: usize,
    ) -> &mut Self {
        self.insert_boxed(Box::new(f), position)
    }

    /// Inserts an argument-less step at the front.
    pub fn push_front(&mut self, f: impl FnMut() -> Status + Send + 'static) -> &mut Self {
        self.insert(f, 0)
    }

    fn insert_boxed(&mut self, step: BoxedStep, position: usize) -> &mut Self {
        let position = if position > self.steps.len() {
            warn!(position, len = self.steps.len(), "insert position past the end, appending");
            self.steps.len()
        } else {
            position
        };
        self.steps.insert(position, step);
        self
    }

    /// Appends `sub` as a single step that drives it until it drains.
    ///
    /// An error inside `sub` clears `sub`, which the wrapper then reports as a
    /// normal completion: the parent path carries on. Use `branch_strict` to
    /// abort the parent instead.
    pub fn branch(&mut self, sub: ContinuationPath) -> &mut Self {
        self.add_step(Branch { sub, strict: false })
    }

    /// Like `branch`, but an error inside `sub` aborts this path too.
    pub fn branch_strict(&mut self, sub: ContinuationPath) -> &mut Self {
        self.add_step(Branch { sub, strict: true })
    }

    pub fn branch_steps(&mut self, steps: impl IntoIterator<Item = BoxedStep>) -> &mut Self {
        let mut sub = self.sub_path();
        sub.add_all(steps);
        self.branch(sub)
    }

    /// Builds a sub-path with `build` and appends it as a branch.
    pub fn branch_with(&mut self, build: impl FnOnce(&mut ContinuationPath)) -> &mut Self {
        let mut sub = self.sub_path();
        build(&mut sub);
        self.branch(sub)
    }

    /// Pauses the path for at least `duration` of table time.
    pub fn wait(&mut self, tasks: &TaskTable, duration: Duration) -> &mut Self {
        self.wait_with(tasks, None, duration, None)
    }

    /// Runs `before`, then pauses for `duration`.
    pub fn act_then_wait(
        &mut self,
        tasks: &TaskTable,
        before: impl FnMut() + Send + 'static,
        duration: Duration,
    ) -> &mut Self {
        self.wait_with(tasks, Some(Box::new(before)), duration, None)
    }

    /// Runs `before`, pauses for `duration`, then runs `after`.
    ///
    /// The pause is a uniquely keyed wait lock in `tasks`; the path polls
    /// `tasks.exists` and resumes in the tick after the table reaps the lock.
    /// `tasks` must be updated by the host for the wait to ever end.
    pub fn wait_with(
        &mut self,
        tasks: &TaskTable,
        before: Option<Action>,
        duration: Duration,
        after: Option<Action>,
    ) -> &mut Self {
        let key = unique_key();
        let tasks = tasks.clone();

        self.branch_with(move |sub| {
            if let Some(mut before) = before {
                sub.add(move || {
                    before();
                    Status::Immediate
                });
            }

            let lock_tasks = tasks.clone();
            let lock_key = key.clone();
            sub.add(move || {
                lock_tasks.add_wait_lock(lock_key.clone(), duration);
                Status::Immediate
            });

            sub.add(move || {
                if tasks.exists(&key) {
                    Status::Continue
                } else {
                    Status::Immediate
                }
            });

            if let Some(mut after) = after {
                sub.add(move || {
                    after();
                    Status::Ok
                });
            }
        })
    }

    /// Skips the current step without invoking it.
    ///
    /// Called from inside a running step, this abandons that step regardless
    /// of the status it returns, unless that status is `Error`.
    pub fn next(&mut self) -> &mut Self {
        if self.running {
            self.interrupted = true;
        } else if self.steps.pop_front().is_none() {
            return self;
        }
        if !self.steps.is_empty() {
            self.emit(PathEvent::Advanced);
        }
        self
    }

    /// Drops every queued step and announces the path as finished.
    ///
    /// Called from inside a running step, `Finished` is deferred until that
    /// step has returned, so an `Error` from the same step reports `Errored`
    /// first.
    pub fn stop(&mut self) -> &mut Self {
        if self.running {
            self.steps.clear();
            self.interrupted = true;
            self.stopped = true;
        } else if !self.steps.is_empty() {
            self.steps.clear();
            self.emit(PathEvent::Finished);
        }
        self
    }

    /// Alias of `stop`.
    pub fn clear(&mut self) -> &mut Self {
        self.stop()
    }

    /// Invokes the front step and acts on its status.
    ///
    /// `Ok` pops the step, `Immediate` pops it and runs the next one right away
    /// (up to the configured chain bound), `Error` clears the path and
    /// `Continue`/`Wait` leave it for the next tick. Once the path is empty,
    /// `Finished` fires, followed by `Succeeded` unless this call errored or a
    /// step stopped the path.
    pub fn update(&mut self) -> PathTick {
        let mut tick = PathTick::default();
        if self.running {
            warn!("update called from inside a running step, ignoring");
            return tick;
        }

        while let Some(mut current) = self.steps.pop_front() {
            self.running = true;
            let status = current.invoke(self);
            self.running = false;
            let interrupted = mem::take(&mut self.interrupted);

            tick.steps_run += 1;
            tick.last_status = Some(status);
            trace!(?status, remaining = self.steps.len(), "step returned");

            match status {
                Status::Ok | Status::Immediate => {
                    if !interrupted && !self.steps.is_empty() {
                        self.emit(PathEvent::Advanced);
                    }
                }
                Status::Error => {
                    self.steps.clear();
                    tick.errored = true;
                    self.emit(PathEvent::Errored);
                }
                Status::Continue | Status::Wait => {
                    if !interrupted {
                        self.steps.push_front(current);
                    }
                }
            }

            if status != Status::Immediate || self.stopped {
                break;
            }
            if tick.steps_run > self.max_immediate_chain && !self.steps.is_empty() {
                warn!(
                    limit = self.max_immediate_chain,
                    "immediate chain limit reached, resuming next tick"
                );
                tick.chain_limited = true;
                break;
            }
        }

        let stopped = mem::take(&mut self.stopped);
        if stopped {
            self.emit(PathEvent::Finished);
        }
        if tick.steps_run > 0 && self.steps.is_empty() {
            tick.drained = true;
            if !stopped {
                self.emit(PathEvent::Finished);
                if !tick.errored {
                    self.emit(PathEvent::Succeeded);
                }
            }
        }
        tick
    }

    fn sub_path(&self) -> ContinuationPath {
        ContinuationPath::with_immediate_limit(self.max_immediate_chain)
    }

    fn emit(&self, event: PathEvent) {
        if let Some(sender) = &self.path_event_sender {
            sender.send(event).ok();
        }
    }
}

impl Default for ContinuationPath {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContinuationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationPath")
            .field("steps", &self.steps.len())
            .field("running", &self.running)
            .field("max_immediate_chain", &self.max_immediate_chain)
            .finish()
    }
}

/// The single step a branch occupies in its parent path.
struct Branch {
    sub: ContinuationPath,
    strict: bool,
}

impl Step for Branch {
    fn invoke(&mut self, _parent: &mut ContinuationPath) -> Status {
        let tick = self.sub.update();
        if self.strict && tick.errored {
            return Status::Error;
        }
        if self.sub.is_empty() {
            Status::Immediate
        } else {
            Status::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn drain(rx: &mut broadcast::Receiver<PathEvent>) -> Vec<PathEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn counting(count: &Arc<AtomicUsize>, status: Status) -> BoxedStep {
        let count = count.clone();
        step(move || {
            count.fetch_add(1, Ordering::Relaxed);
            status
        })
    }

    #[test]
    fn ok_steps_drain_one_per_update() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        let count = Arc::new(AtomicUsize::new(0));
        path.add_all((0..4).map(|_| counting(&count, Status::Ok)));

        for n in 1..4 {
            path.update();
            assert_eq!(count.load(Ordering::Relaxed), n);
            assert_eq!(drain(&mut rx), vec![PathEvent::Advanced]);
        }
        let tick = path.update();

        assert!(tick.drained);
        assert!(path.is_empty());
        assert_eq!(drain(&mut rx), vec![PathEvent::Finished, PathEvent::Succeeded]);
        assert_eq!(path.update(), PathTick::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn error_clears_the_whole_path() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        let count = Arc::new(AtomicUsize::new(0));
        path.add(|| Status::Ok)
            .add(|| Status::Error)
            .add_all((0..3).map(|_| counting(&count, Status::Ok)));

        path.update();
        drain(&mut rx);
        let tick = path.update();

        assert!(tick.errored && tick.drained);
        assert!(path.is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(drain(&mut rx), vec![PathEvent::Errored, PathEvent::Finished]);
    }

    #[test]
    fn immediate_resolves_within_one_update() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        path.add(|| Status::Immediate).add(|| Status::Ok);

        let tick = path.update();

        assert_eq!(tick.steps_run, 2);
        assert!(path.is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![PathEvent::Advanced, PathEvent::Finished, PathEvent::Succeeded]
        );
    }

    #[test]
    fn continue_retries_the_same_step() {
        let mut path = ContinuationPath::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        path.add(move || {
            if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                Status::Continue
            } else {
                Status::Ok
            }
        });

        path.update();
        path.update();
        assert_eq!(path.len(), 1);
        path.update();
        assert!(path.is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn immediate_chain_is_bounded() {
        let mut path = ContinuationPath::with_immediate_limit(3);
        let count = Arc::new(AtomicUsize::new(0));
        path.add_all((0..10).map(|_| counting(&count, Status::Immediate)));

        let tick = path.update();
        assert!(tick.chain_limited);
        assert_eq!(tick.steps_run, 4);
        assert_eq!(path.len(), 6);

        path.update();
        path.update();
        assert!(path.is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn branch_completes_before_parent_moves_on() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = |label: &'static str| {
            let order = order.clone();
            step(move || {
                order.lock().unwrap().push(label);
                Status::Ok
            })
        };

        let mut path = ContinuationPath::new();
        path.add_all([log("first")])
            .branch_steps([log("inner-1"), log("inner-2")])
            .add_all([log("last")]);

        let mut updates = 0;
        while !path.is_empty() {
            path.update();
            updates += 1;
        }

        assert_eq!(*order.lock().unwrap(), vec!["first", "inner-1", "inner-2", "last"]);
        // The branch hands over to "last" in the same tick its sub-path drains.
        assert_eq!(updates, 3);
    }

    #[test]
    fn branch_swallows_sub_path_errors() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        let after = Arc::new(AtomicUsize::new(0));
        path.branch_with(|sub| {
            sub.add(|| Status::Error).add(|| Status::Ok);
        })
        .add_all([counting(&after, Status::Ok)]);

        let tick = path.update();

        assert!(!tick.errored);
        assert_eq!(after.load(Ordering::Relaxed), 1);
        assert_eq!(
            drain(&mut rx),
            vec![PathEvent::Advanced, PathEvent::Finished, PathEvent::Succeeded]
        );
    }

    #[test]
    fn strict_branch_propagates_sub_path_errors() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        let after = Arc::new(AtomicUsize::new(0));
        let mut sub = ContinuationPath::new();
        sub.add(|| Status::Error);
        path.branch_strict(sub).add_all([counting(&after, Status::Ok)]);

        let tick = path.update();

        assert!(tick.errored);
        assert!(path.is_empty());
        assert_eq!(after.load(Ordering::Relaxed), 0);
        assert_eq!(drain(&mut rx), vec![PathEvent::Errored, PathEvent::Finished]);
    }

    #[test]
    fn empty_branch_is_a_no_op() {
        let mut path = ContinuationPath::new();
        path.branch(ContinuationPath::new()).add(|| Status::Ok);
        assert_eq!(path.update().steps_run, 2);
        assert!(path.is_empty());
    }

    #[test]
    fn path_aware_step_can_extend_its_path() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = rounds.clone();
        let mut path = ContinuationPath::new();
        path.add_with_path(move |p| {
            if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                let again = counter.clone();
                p.add_with_path(move |p| {
                    again.fetch_add(1, Ordering::Relaxed);
                    p.add(|| Status::Ok);
                    Status::Ok
                });
            }
            Status::Ok
        });

        path.update();
        assert_eq!(path.len(), 1);
        path.update();
        assert_eq!(path.len(), 1);
        path.update();
        assert!(path.is_empty());
        assert_eq!(rounds.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn next_skips_without_invoking() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        let skipped = Arc::new(AtomicUsize::new(0));
        path.add_all([counting(&skipped, Status::Ok)]).add(|| Status::Ok);

        path.next();
        assert_eq!(path.len(), 1);
        assert_eq!(skipped.load(Ordering::Relaxed), 0);
        assert_eq!(drain(&mut rx), vec![PathEvent::Advanced]);

        path.next();
        assert!(path.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn next_from_inside_abandons_a_continuing_step() {
        let mut path = ContinuationPath::new();
        path.add_with_path(|p| {
            p.next();
            Status::Continue
        })
        .add(|| Status::Continue);

        path.update();
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn stop_empties_and_finishes_once() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        path.add(|| Status::Continue).add(|| Status::Ok);

        path.stop();
        path.stop();

        assert!(path.is_empty());
        assert_eq!(drain(&mut rx), vec![PathEvent::Finished]);
    }

    #[test]
    fn stop_from_inside_a_step() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        path.add_with_path(|p| {
            p.stop();
            Status::Continue
        })
        .add(|| Status::Ok);

        let tick = path.update();

        assert!(tick.drained);
        assert!(path.is_empty());
        assert_eq!(drain(&mut rx), vec![PathEvent::Finished]);
    }

    #[test]
    fn stop_then_error_reports_errored_before_finished() {
        let mut path = ContinuationPath::new();
        let mut rx = path.subscribe();
        path.add_with_path(|p| {
            p.stop();
            Status::Error
        })
        .add(|| Status::Ok);

        let tick = path.update();

        assert!(tick.errored);
        assert!(path.is_empty());
        assert_eq!(drain(&mut rx), vec![PathEvent::Errored, PathEvent::Finished]);
    }

    #[test]
    fn insert_positions_and_clamping() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |label: &'static str| {
            let order = order.clone();
            move || {
                order.lock().unwrap().push(label);
                Status::Immediate
            }
        };

        let mut path = ContinuationPath::new();
        path.add(push("b"))
            .push_front(push("a"))
            .insert(push("c"), 99)
            .insert(push("between"), 1);
        path.update();

        assert_eq!(*order.lock().unwrap(), vec!["a", "between", "b", "c"]);
    }

    #[test]
    fn wait_pauses_until_the_lock_is_reaped() {
        let tasks = TaskTable::new();
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let (b, a) = (before.clone(), after.clone());

        let mut path = ContinuationPath::new();
        path.wait_with(
            &tasks,
            Some(Box::new(move || {
                b.fetch_add(1, Ordering::Relaxed);
            })),
            Duration::from_secs(2),
            Some(Box::new(move || {
                a.fetch_add(1, Ordering::Relaxed);
            })),
        );

        let dt = Duration::from_millis(500);
        let mut ticks = 0;
        while !path.is_empty() {
            path.update();
            tasks.update(dt);
            ticks += 1;
            assert!(ticks < 100, "wait never finished");
        }

        assert!(ticks >= 4);
        assert_eq!(before.load(Ordering::Relaxed), 1);
        assert_eq!(after.load(Ordering::Relaxed), 1);
        assert!(tasks.is_empty());
    }

    #[test]
    fn stopped_wait_leaves_lock_to_expire() {
        let tasks = TaskTable::new();
        let mut path = ContinuationPath::new();
        path.wait(&tasks, Duration::from_secs(1));

        path.update();
        assert_eq!(tasks.len(), 1);
        path.stop();

        tasks.update(Duration::from_secs(1));
        assert!(tasks.is_empty());
    }
}
