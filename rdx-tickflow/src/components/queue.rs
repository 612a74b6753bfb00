//! A FIFO of one-shot, delayed and interval callbacks.
//!
//! The queue has no notion of status or identity: entries are plain callbacks
//! stored in arrival order. `execute` drains at most a bounded number of them
//! per tick so a burst of due timers cannot monopolise a frame.

use crate::common::lock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// A function closure queued for later execution.
pub type Callback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Timing {
    Now,
    Delayed { remaining: f64 },
    Interval { remaining: f64, every: f64 },
}

struct TimedEvent {
    callback: Callback,
    timing: Timing,
}

/// A shared handle to a queue of timed callbacks.
#[derive(Clone, Default)]
pub struct TimedQueue {
    entries: Arc<Mutex<VecDeque<TimedEvent>>>,
}

impl TimedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `callback` to run on the next `execute`.
    pub fn add(&self, callback: impl FnMut() + Send + 'static) {
        self.push(Box::new(callback), Timing::Now);
    }

    /// Queues `callback` to run once, after `delay`.
    pub fn add_delayed(&self, callback: impl FnMut() + Send + 'static, delay: Duration) {
        self.push(
            Box::new(callback),
            Timing::Delayed {
                remaining: delay.as_secs_f64(),
            },
        );
    }

    /// Queues `callback` to run every `every`, forever.
    pub fn add_interval(&self, callback: impl FnMut() + Send + 'static, every: Duration) {
        let every = every.as_secs_f64();
        self.push(
            Box::new(callback),
            Timing::Interval {
                remaining: every,
                every,
            },
        );
    }

    /// Queues a delayed callback, repeating it if `repeating` is set.
    pub fn add_timed(&self, callback: impl FnMut() + Send + 'static, delay: Duration, repeating: bool) {
        if repeating {
            self.add_interval(callback, delay);
        } else {
            self.add_delayed(callback, delay);
        }
    }

    /// Processes up to `max_count` entries from the front of the queue.
    ///
    /// Immediate entries fire. Timed entries have `delta` taken off their
    /// countdown; those still pending go to the back untouched, due ones fire
    /// and intervals are re-armed behind everything else. Returns the number
    /// of callbacks invoked.
    ///
    /// Each entry is visited at most once per call: `max_count` is capped at
    /// the queue length at the time of the call, so entries re-queued or added
    /// during the call wait for the next one.
    pub fn execute(&self, delta: Duration, max_count: usize) -> usize {
        let delta = delta.as_secs_f64();
        let budget = max_count.min(self.len());
        let mut fired = 0;

        for _ in 0..budget {
            let Some(mut event) = lock(&self.entries).pop_front() else {
                break;
            };
            let due = match &mut event.timing {
                Timing::Now => true,
                Timing::Delayed { remaining } | Timing::Interval { remaining, .. } => {
                    *remaining -= delta;
                    *remaining <= 0.0
                }
            };
            if !due {
                lock(&self.entries).push_back(event);
                continue;
            }

            (event.callback)();
            fired += 1;

            if let Timing::Interval { remaining, every } = &mut event.timing {
                *remaining += *every;
                lock(&self.entries).push_back(event);
            }
        }

        trace!(fired, pending = self.len(), "timed queue executed");
        fired
    }

    /// Processes every entry queued at the time of the call, exactly once.
    pub fn execute_all(&self, delta: Duration) -> usize {
        self.execute(delta, usize::MAX)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    fn push(&self, callback: Callback, timing: Timing) {
        lock(&self.entries).push_back(TimedEvent { callback, timing });
    }
}

impl fmt::Debug for TimedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timings: Vec<Timing> = lock(&self.entries).iter().map(|e| e.timing).collect();
        f.debug_struct("TimedQueue").field("entries", &timings).finish()
    }
}
