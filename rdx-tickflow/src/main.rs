use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickflow::components::task::TaskArgs;
use tickflow::prelude::*;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    // 2. Load the configuration, optionally from a TOML file given as first argument.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TickflowConfig::load(config_path.as_deref())?;

    // 3. Create the TickflowEngine instance.
    let engine = TickflowEngine::new(config);

    // 4. Spawn concurrent tasks to listen to different event streams.
    spawn_event_listeners(&engine);

    // 5. Register tasks, timers and paths to exercise the engine's core logic.
    let demo_path = register_test_components(&engine);

    // 6. Run the engine until the demo path retires or Ctrl+C.
    let watcher = engine.clone();
    engine
        .run_until(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = async {
                    while watcher.has_path(demo_path) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                } => {}
            }
        })
        .await?;

    Ok(())
}

/// Spawns several tasks, each subscribing to a different event stream from the engine.
fn spawn_event_listeners(engine: &TickflowEngine) {
    let mut system_rx = engine.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            match event {
                SystemEvent::TickCompleted { .. } => {}
                other => info!("[SYSTEM] => {:?}", other),
            }
        }
    });

    let mut task_rx = engine.tasks().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = task_rx.recv().await {
            info!("[TASK] => {:?}", event);
        }
    });
}

/// Registers demo components with the engine and returns the id of the main path.
fn register_test_components(engine: &TickflowEngine) -> PathId {
    let shared_counter = Arc::new(AtomicU32::new(0));

    // --- A periodic named task: five pulses, one per second ---
    let counter_clone = shared_counter.clone();
    engine.tasks().add_periodic_with_args(
        "pulse",
        move |state| {
            let label = state.args().get_or("label", String::from("pulse"));
            let current = counter_clone.fetch_add(1, Ordering::Relaxed) + 1;
            info!("[PERIODIC] {} #{} (counter = {})", label, state.invocations(), current);
            state.proceed()
        },
        Duration::from_secs(1),
        Repeat::Times(5),
        TaskArgs::new().with("label", String::from("heartbeat")),
    );

    // --- A repeating timer on the timed queue ---
    engine.timers().add_interval(
        || info!("[TIMER] 2-second interval fired"),
        Duration::from_secs(2),
    );

    // --- A path: greet, wait, branch, then wait for the pulses to finish ---
    let tasks = engine.tasks().clone();
    let counter_clone = shared_counter.clone();
    let mut path = engine.path();
    path.add(|| {
        info!("[PATH] => Step 1: Initializing...");
        Status::Ok
    })
    .wait_with(
        engine.tasks(),
        Some(Box::new(|| info!("[PATH] => Waiting 1.5s..."))),
        Duration::from_millis(1500),
        Some(Box::new(|| info!("[PATH] => ...done waiting."))),
    )
    .branch_with(|sub| {
        sub.add(|| {
            info!("[BRANCH] => Sub-step A");
            Status::Ok
        })
        .add(|| {
            warn!("[BRANCH] => Sub-step B fails; the branch swallows it");
            Status::Error
        })
        .add(|| {
            info!("[BRANCH] => Never runs");
            Status::Ok
        });
    })
    .add(move || {
        if tasks.exists("pulse") {
            Status::Continue
        } else {
            info!(
                "[PATH] => Step 3: Pulses finished, counter = {}",
                counter_clone.load(Ordering::Relaxed)
            );
            Status::Ok
        }
    });

    let mut path_rx = path.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = path_rx.recv().await {
            info!("[PATH EVENT] => {:?}", event);
        }
    });

    engine.spawn_path(path)
}
