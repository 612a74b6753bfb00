use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickflow::prelude::*;

fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn ticks_until_retired(engine: &TickflowEngine, id: PathId, dt: Duration) -> u32 {
    let mut ticks = 0;
    while engine.has_path(id) {
        engine.tick(dt);
        ticks += 1;
        assert!(ticks < 10_000, "path never retired");
    }
    ticks
}

#[test]
fn wait_never_finishes_early() {
    for (seconds, dt_ms) in [(2.0_f64, 500_u64), (2.0, 100), (1.0, 16), (0.5, 1000)] {
        let engine = TickflowEngine::default();
        let mut path = engine.path();
        path.wait(engine.tasks(), Duration::from_secs_f64(seconds));
        let id = engine.spawn_path(path);

        let dt = Duration::from_millis(dt_ms);
        let ticks = ticks_until_retired(&engine, id, dt);

        let minimum = (seconds / dt.as_secs_f64()).ceil() as u32;
        assert!(
            ticks >= minimum,
            "wait({seconds}) at dt={dt_ms}ms drained after {ticks} ticks, expected at least {minimum}"
        );
        assert!(engine.tasks().is_empty());
    }
}

#[test]
fn spawned_path_retires_with_events() {
    let engine = TickflowEngine::default();
    let mut system_rx = engine.subscribe_system_events();

    let mut path = engine.path();
    let mut path_rx = path.subscribe();
    path.add(|| Status::Ok).add(|| Status::Ok);
    let id = engine.spawn_path(path);

    let first = engine.tick(Duration::from_millis(16));
    assert_eq!(first.paths_updated, 1);
    assert_eq!(first.paths_retired, 0);
    let second = engine.tick(Duration::from_millis(16));
    assert_eq!(second.paths_retired, 1);
    assert!(!engine.has_path(id));

    assert_eq!(
        drain(&mut path_rx),
        vec![PathEvent::Advanced, PathEvent::Finished, PathEvent::Succeeded]
    );
    let retired: Vec<bool> = drain(&mut system_rx)
        .into_iter()
        .filter_map(|event| match event {
            SystemEvent::PathRetired { id: retired_id, succeeded } if retired_id == id => Some(succeeded),
            _ => None,
        })
        .collect();
    assert_eq!(retired, vec![true]);
}

#[test]
fn errored_path_is_retired_as_failed_and_can_be_retried() {
    let engine = TickflowEngine::default();
    let mut system_rx = engine.subscribe_system_events();
    let attempts = Arc::new(AtomicU32::new(0));

    let build = |attempts: Arc<AtomicU32>| {
        let mut path = engine.path();
        path.add(move || {
            if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                Status::Error
            } else {
                Status::Ok
            }
        });
        path
    };

    let id = engine.spawn_path(build(attempts.clone()));
    engine.tick(Duration::ZERO);
    assert!(!engine.has_path(id));

    let failed = drain(&mut system_rx).into_iter().any(|event| {
        matches!(event, SystemEvent::PathRetired { succeeded: false, .. })
    });
    assert!(failed);

    // Retrying is the host's job: it re-spawns after observing the failure.
    let retry = engine.spawn_path(build(attempts.clone()));
    engine.tick(Duration::ZERO);
    assert!(!engine.has_path(retry));
    assert_eq!(attempts.load(Ordering::Relaxed), 2);
}

#[test]
fn remove_path_cancels_without_running() {
    let engine = TickflowEngine::default();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let mut path = engine.path();
    path.add(move || {
        counter.fetch_add(1, Ordering::Relaxed);
        Status::Continue
    });
    let id = engine.spawn_path(path);

    engine.tick(Duration::ZERO);
    assert!(engine.remove_path(id));
    assert!(!engine.remove_path(id));
    engine.tick(Duration::ZERO);

    assert_eq!(runs.load(Ordering::Relaxed), 1);
}

#[test]
fn periodic_task_and_path_share_the_table() {
    let engine = TickflowEngine::default();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let log = hits.clone();
    engine.tasks().add_periodic(
        "spawner",
        move |state| {
            log.lock().unwrap().push(state.age_secs());
            state.proceed()
        },
        Duration::from_secs(1),
        Repeat::Times(5),
    );

    let tasks = engine.tasks().clone();
    let mut path = engine.path();
    path.add(move || {
        if tasks.exists("spawner") {
            Status::Continue
        } else {
            Status::Ok
        }
    });
    let id = engine.spawn_path(path);

    let ticks = ticks_until_retired(&engine, id, Duration::from_secs(1));

    assert_eq!(*hits.lock().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(ticks, 5);
}

#[test]
fn timed_queue_respects_per_tick_bound() {
    let config = TickflowConfig {
        max_events_per_tick: Some(2),
        ..TickflowConfig::default()
    };
    let engine = TickflowEngine::new(config);
    let fired = Arc::new(AtomicU32::new(0));
    for _ in 0..5 {
        let fired = fired.clone();
        engine.timers().add(move || {
            fired.fetch_add(1, Ordering::Relaxed);
        });
    }

    let report = engine.tick(Duration::from_millis(16));
    assert_eq!(report.callbacks_fired, 2);
    assert_eq!(engine.timers().len(), 3);

    engine.tick(Duration::from_millis(16));
    engine.tick(Duration::from_millis(16));
    assert_eq!(fired.load(Ordering::Relaxed), 5);
    assert!(engine.timers().is_empty());
}

#[test]
fn per_tick_bound_larger_than_the_queue_keeps_real_time() {
    let config = TickflowConfig {
        max_events_per_tick: Some(8),
        ..TickflowConfig::default()
    };
    let engine = TickflowEngine::new(config);
    let delayed = Arc::new(AtomicU32::new(0));
    let interval = Arc::new(AtomicU32::new(0));
    let counter = delayed.clone();
    engine.timers().add_delayed(
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
        },
        Duration::from_millis(100),
    );
    let counter = interval.clone();
    engine.timers().add_interval(
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
        },
        Duration::from_millis(16),
    );

    let report = engine.tick(Duration::from_millis(16));
    assert_eq!(report.callbacks_fired, 1);
    assert_eq!(delayed.load(Ordering::Relaxed), 0);
    assert_eq!(interval.load(Ordering::Relaxed), 1);

    for _ in 0..5 {
        engine.tick(Duration::from_millis(16));
    }
    assert_eq!(delayed.load(Ordering::Relaxed), 0);
    assert_eq!(interval.load(Ordering::Relaxed), 6);

    engine.tick(Duration::from_millis(16));
    assert_eq!(delayed.load(Ordering::Relaxed), 1);
    assert_eq!(interval.load(Ordering::Relaxed), 7);
}

#[test]
fn panicking_step_retires_its_path() {
    let engine = TickflowEngine::default();
    let mut system_rx = engine.subscribe_system_events();
    let mut path = engine.path();
    path.add(|| panic!("step blew up"));
    let id = engine.spawn_path(path);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        engine.tick(Duration::ZERO);
    }));
    assert!(outcome.is_err());
    assert!(!engine.has_path(id));
    assert!(drain(&mut system_rx).into_iter().any(|event| matches!(
        event,
        SystemEvent::PathRetired { id: retired, succeeded: false } if retired == id
    )));

    let mut survivor = engine.path();
    survivor.add(|| Status::Ok);
    let next = engine.spawn_path(survivor);
    let report = engine.tick(Duration::ZERO);
    assert_eq!(report.paths_updated, 1);
    assert!(!engine.has_path(next));
}

#[test]
fn empty_spawn_is_not_reported_as_success() {
    let engine = TickflowEngine::default();
    let mut system_rx = engine.subscribe_system_events();
    let id = engine.spawn_path(engine.path());

    let report = engine.tick(Duration::ZERO);
    assert_eq!(report.paths_retired, 1);
    assert!(drain(&mut system_rx).into_iter().any(|event| matches!(
        event,
        SystemEvent::PathRetired { id: retired, succeeded: false } if retired == id
    )));
}

#[test]
fn step_can_spawn_sibling_paths_mid_tick() {
    let engine = TickflowEngine::default();
    let handle = engine.clone();
    let mut path = engine.path();
    path.add(move || {
        let mut child = handle.path();
        child.add(|| Status::Continue);
        handle.spawn_path(child);
        Status::Ok
    });
    engine.spawn_path(path);

    let report = engine.tick(Duration::ZERO);
    assert_eq!(report.paths_retired, 1);
    assert_eq!(engine.path_ids().len(), 1);

    let report = engine.tick(Duration::ZERO);
    assert_eq!(report.paths_updated, 1);
}

#[tokio::test]
async fn run_until_drives_the_engine_from_its_clock() {
    let config = TickflowConfig {
        resolution: ClockResolution::Custom {
            ticks_per_second: 200,
        },
        ..TickflowConfig::default()
    };
    let engine = TickflowEngine::new(config);
    let mut path = engine.path();
    path.wait(engine.tasks(), Duration::from_millis(20));
    let id = engine.spawn_path(path);

    let watcher = engine.clone();
    let shutdown = async move {
        while watcher.has_path(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), engine.run_until(shutdown))
        .await
        .expect("engine stops once the path retires")
        .unwrap();

    assert!(!engine.has_path(id));
    assert!(engine.tick_count() > 0);
}
