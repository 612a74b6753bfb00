//! The context handle that owns and drives every Tickflow component.

use crate::common::{lock, PathId};
use crate::components::path::ContinuationPath;
use crate::components::queue::TimedQueue;
use crate::components::table::TaskTable;
use crate::config::TickflowConfig;
use crate::events::SystemEvent;
use crate::time::{SystemClock, TickEvent};
use chrono::Utc;
use slotmap::SlotMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, trace};

/// Summary of a single `TickflowEngine::tick`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick_count: u64,
    /// Named tasks that resolved and were removed from the table.
    pub tasks_reaped: usize,
    /// Hosted paths that were updated.
    pub paths_updated: usize,
    /// Hosted paths that drained and were retired.
    pub paths_retired: usize,
    /// Timed-queue callbacks that fired.
    pub callbacks_fired: usize,
}

/// The main Tickflow engine.
///
/// This struct replaces process-wide singletons with one explicit handle: it
/// holds the default `TaskTable` and `TimedQueue`, plus any `ContinuationPath`s
/// handed to it with `spawn_path`. The engine is cheap to clone; every clone
/// drives the same components.
#[derive(Clone)]
pub struct TickflowEngine {
    config: Arc<TickflowConfig>,
    tasks: TaskTable,
    timers: TimedQueue,
    // A hosted path is taken out of its slot while it updates.
    paths: Arc<Mutex<SlotMap<PathId, Option<ContinuationPath>>>>,
    tick_count: Arc<AtomicU64>,
    tick_sender: broadcast::Sender<Arc<TickEvent>>,
    system_event_sender: broadcast::Sender<SystemEvent>,
}

// Core implementation block for internal logic.
impl TickflowEngine {
    /// Creates a new `TickflowEngine` with the given configuration.
    pub fn new(config: TickflowConfig) -> Self {
        let (tick_sender, _) = broadcast::channel(256);
        let (system_event_sender, _) = broadcast::channel(64);
        Self {
            config: Arc::new(config),
            tasks: TaskTable::new(),
            timers: TimedQueue::new(),
            paths: Arc::new(Mutex::new(SlotMap::with_key())),
            tick_count: Arc::new(AtomicU64::new(0)),
            tick_sender,
            system_event_sender,
        }
    }

    /// Advances every component by one tick of `delta`.
    ///
    /// Order: the task table first, then every hosted path in insertion order,
    /// then the timed queue bounded by `max_events_per_tick`. Paths that are
    /// empty after their update are retired; a path that never ran a step is
    /// reported as not succeeded.
    pub fn tick(&self, delta: Duration) -> TickReport {
        let tick_count = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut report = TickReport {
            tick_count,
            ..TickReport::default()
        };

        report.tasks_reaped = self.tasks.update(delta);

        let ids: Vec<PathId> = lock(&self.paths).keys().collect();
        for id in ids {
            let Some(mut path) = lock(&self.paths).get_mut(id).and_then(Option::take) else {
                continue;
            };
            let _guard = PathCheckout { engine: self, id };
            let outcome = path.update();
            report.paths_updated += 1;

            let mut paths = lock(&self.paths);
            if !path.is_empty() {
                if let Some(slot) = paths.get_mut(id) {
                    *slot = Some(path);
                }
                continue;
            }
            if paths.remove(id).is_some() {
                drop(paths);
                report.paths_retired += 1;
                self.system_event_sender
                    .send(SystemEvent::PathRetired {
                        id,
                        succeeded: outcome.drained && !outcome.errored,
                    })
                    .ok();
            }
        }

        report.callbacks_fired = match self.config.max_events_per_tick {
            Some(max) => self.timers.execute(delta, max),
            None => self.timers.execute_all(delta),
        };

        trace!(?report, "tick complete");
        self.system_event_sender
            .send(SystemEvent::TickCompleted {
                tick_count,
                wall_clock: Utc::now(),
            })
            .ok();
        report
    }

    #[doc(hidden)]
    async fn dispatcher_loop(&self, mut tick_rx: broadcast::Receiver<Arc<TickEvent>>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        self.system_event_sender
            .send(SystemEvent::EngineStarted {
                timestamp: tokio::time::Instant::now(),
            })
            .ok();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Ok(tick) = tick_rx.recv() => {
                    self.tick(tick.delta);
                }
            }
        }
    }
}

// Retires a hosted path whose update unwinds while it is checked out, so its
// slot does not stay empty forever.
struct PathCheckout<'a> {
    engine: &'a TickflowEngine,
    id: PathId,
}

impl Drop for PathCheckout<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let mut paths = lock(&self.engine.paths);
        if !matches!(paths.get(self.id), Some(None)) {
            return;
        }
        paths.remove(self.id);
        drop(paths);

        error!(id = ?self.id, "path step panicked, retiring the path");
        self.engine
            .system_event_sender
            .send(SystemEvent::PathRetired {
                id: self.id,
                succeeded: false,
            })
            .ok();
    }
}

// Public API implementation block.
impl TickflowEngine {
    /// Runs the engine off its own `SystemClock` until Ctrl+C.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// Runs the engine off its own `SystemClock` until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        info!("TickflowEngine starting up...");
        let period = self.config.resolution.tick_interval()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let tick_rx = self.tick_sender.subscribe();
        let clock = SystemClock::new(period, self.tick_sender.clone());
        let clock_shutdown_rx = shutdown_tx.subscribe();
        let clock_task = tokio::spawn(async move { clock.run(clock_shutdown_rx).await });

        info!(
            "Engine running at {:?} ({:?} per tick).",
            self.config.resolution, period
        );
        self.dispatcher_loop(tick_rx, shutdown).await;

        info!("Shutdown signal received. Stopping the clock...");
        if shutdown_tx.send(()).is_err() {
            error!("Failed to send shutdown signal. The clock may not terminate gracefully.");
        }
        clock_task.await.ok();
        self.system_event_sender
            .send(SystemEvent::EngineShutdown)
            .ok();
        info!("TickflowEngine has shut down.");
        Ok(())
    }

    pub fn config(&self) -> &TickflowConfig {
        &self.config
    }

    /// The engine's named task table.
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    /// The engine's timed callback queue.
    pub fn timers(&self) -> &TimedQueue {
        &self.timers
    }

    /// Creates an empty path using the engine's `Immediate` chain bound.
    pub fn path(&self) -> ContinuationPath {
        ContinuationPath::with_immediate_limit(self.config.max_immediate_chain)
    }

    /// Hands `path` to the engine, which updates it every tick until it drains.
    pub fn spawn_path(&self, path: ContinuationPath) -> PathId {
        let id = lock(&self.paths).insert(Some(path));
        self.system_event_sender
            .send(SystemEvent::PathAdded { id })
            .ok();
        id
    }

    /// Removes a hosted path without finishing it.
    ///
    /// Returns `true` if the path was found and removed.
    pub fn remove_path(&self, id: PathId) -> bool {
        let was_removed = lock(&self.paths).remove(id).is_some();
        if was_removed {
            self.system_event_sender
                .send(SystemEvent::PathRetired {
                    id,
                    succeeded: false,
                })
                .ok();
        }
        was_removed
    }

    pub fn has_path(&self, id: PathId) -> bool {
        lock(&self.paths).contains_key(id)
    }

    pub fn path_ids(&self) -> Vec<PathId> {
        lock(&self.paths).keys().collect()
    }

    /// Number of ticks applied so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Subscribes to the `SystemEvent` stream.
    pub fn subscribe_system_events(&self) -> broadcast::Receiver<SystemEvent> {
        self.system_event_sender.subscribe()
    }

    /// Subscribes to the raw `TickEvent` stream produced while `run` is active.
    pub fn subscribe_tick_events(&self) -> broadcast::Receiver<Arc<TickEvent>> {
        self.tick_sender.subscribe()
    }
}

impl Default for TickflowEngine {
    fn default() -> Self {
        Self::new(TickflowConfig::default())
    }
}
