use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickflow::prelude::*;
use tickflow::{ENGINE_NAME, VERSION as LIB_VERSION};
use tokio::sync::oneshot;
use tracing::info;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct MyHighlighter;

impl Highlighter for MyHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            let colored_command = command.yellow().bold();
            let colored_rest = rest.yellow();
            Cow::Owned(format!("{} {}", colored_command, colored_rest))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    // Embedded at compile time; `logo.log` sits in the root of the `rdx-tickshell` crate.
    const LOGO_TEXT: &str = include_str!("../logo.log");
    println!("{}", LOGO_TEXT.cyan());

    let version_string = format!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!("{}", "-".repeat(64).dimmed());
    println!("{}", version_string);
    println!(
        "{}",
        "    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.".dimmed()
    );
    println!("{}", "-".repeat(64).dimmed());
}

/// Spawns the listeners that echo engine activity back into the shell.
fn spawn_event_listeners(engine: &TickflowEngine, is_listening_to_ticks: Arc<AtomicBool>) {
    let mut system_rx = engine.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            match event {
                SystemEvent::TickCompleted { tick_count, wall_clock } => {
                    if is_listening_to_ticks.load(Ordering::Relaxed) && tick_count % 5 == 0 {
                        println!("<-- [TICK] #{} at {}", tick_count, wall_clock.format("%H:%M:%S%.3f"));
                    }
                }
                other => println!("\n<-- [SYSTEM EVENT] {:?}", other),
            }
        }
    });

    let mut task_rx = engine.tasks().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = task_rx.recv().await {
            println!("<-- [TASK EVENT] {:?}", event);
        }
    });
}

fn parse_seconds(arg: Option<&&str>) -> Option<Duration> {
    let seconds = arg?.parse::<f64>().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn parse_repeat(arg: Option<&&str>) -> Option<Repeat> {
    match *arg? {
        "forever" => Some(Repeat::Forever),
        count => count.parse::<u32>().ok().map(Repeat::Times),
    }
}

/// The shell's state management variables.
struct ShellState {
    engine: TickflowEngine,
    active_paths: HashMap<usize, PathId>,
    next_handle: usize,
    clock: Option<oneshot::Sender<()>>,
}

impl ShellState {
    fn handle_task(&mut self, args: &[&str]) {
        let tasks = self.engine.tasks();
        match (args.get(1), args.get(2)) {
            (Some(&"add"), Some(name)) => match parse_seconds(args.get(3)) {
                Some(delay) => {
                    let label = name.to_string();
                    let outcome = tasks.add(
                        *name,
                        NamedTask::delayed(
                            move |state| {
                                println!("<-- [TASK] '{}' fired after {:.2}s", label, state.age_secs());
                                state.ok()
                            },
                            delay,
                        ),
                    );
                    report_add(&outcome);
                }
                None => println!("Usage: task add <NAME> <SECONDS>"),
            },
            (Some(&"periodic"), Some(name)) => {
                match (parse_seconds(args.get(3)), parse_repeat(args.get(4))) {
                    (Some(period), Some(repeat)) => {
                        let label = name.to_string();
                        let outcome = tasks.add_periodic(
                            *name,
                            move |state| {
                                println!("<-- [TASK] '{}' pulse #{}", label, state.invocations());
                                state.proceed()
                            },
                            period,
                            repeat,
                        );
                        report_add(&outcome);
                    }
                    _ => println!("Usage: task periodic <NAME> <SECONDS> <COUNT|forever>"),
                }
            }
            (Some(&"remove"), Some(name)) => {
                if tasks.remove(name) {
                    println!("--> Task '{}' cancelled.", name);
                } else {
                    println!("--> Error: no live task named '{}'.", name);
                }
            }
            _ => println!("Usage: task <add|periodic|remove> <NAME> ..."),
        }
    }

    fn handle_timer(&mut self, args: &[&str]) {
        let timers = self.engine.timers();
        match (args.get(1), parse_seconds(args.get(2))) {
            (Some(&"once"), Some(delay)) => {
                let secs = delay.as_secs_f64();
                timers.add_delayed(move || println!("<-- [TIMER] {}s one-shot fired", secs), delay);
                println!("--> Queued a {}s one-shot timer.", secs);
            }
            (Some(&"every"), Some(every)) => {
                let secs = every.as_secs_f64();
                timers.add_interval(move || println!("<-- [TIMER] {}s interval fired", secs), every);
                println!("--> Queued a {}s interval timer.", secs);
            }
            _ => println!("Usage: timer <once|every> <SECONDS>"),
        }
    }

    fn handle_path(&mut self, args: &[&str]) {
        match (args.get(1), args.get(2)) {
            (Some(&"wait"), _) => match parse_seconds(args.get(2)) {
                Some(duration) => {
                    let handle = self.next_handle;
                    let mut path = self.engine.path();
                    path.act_then_wait(
                        self.engine.tasks(),
                        move || println!("<-- [PATH #{}] waiting {:?}...", handle, duration),
                        duration,
                    )
                    .add(move || {
                        println!("<-- [PATH #{}] done.", handle);
                        Status::Ok
                    });
                    let id = self.engine.spawn_path(path);
                    self.active_paths.insert(handle, id);
                    self.next_handle += 1;
                    println!("--> Spawned wait path with handle: #{}", handle);
                }
                None => println!("Usage: path wait <SECONDS>"),
            },
            (Some(&"remove"), Some(handle_str)) => match handle_str.parse::<usize>() {
                Ok(handle) => match self.active_paths.remove(&handle) {
                    Some(id) if self.engine.remove_path(id) => {
                        println!("--> Path successfully removed.")
                    }
                    Some(_) => println!("--> Path #{} had already finished.", handle),
                    None => println!(
                        "Error: Invalid handle #{}. Use 'list' to see active paths.",
                        handle
                    ),
                },
                Err(_) => println!("Error: Handle must be a number (e.g., '0', '1')."),
            },
            _ => println!("Usage: path <wait <SECONDS> | remove <HANDLE>>"),
        }
    }

    fn handle_tick(&mut self, args: &[&str]) {
        if self.clock.is_some() {
            println!("Error: the clock is running. 'stop clock' first to step by hand.");
            return;
        }
        let count = match args.get(1).map(|n| n.parse::<u32>()) {
            None => 1,
            Some(Ok(count)) => count,
            Some(Err(_)) => {
                println!("Usage: tick [COUNT] [SECONDS]");
                return;
            }
        };
        let delta = parse_seconds(args.get(2)).unwrap_or(DEFAULT_TICK);
        let mut last = TickReport::default();
        for _ in 0..count {
            last = self.engine.tick(delta);
        }
        println!(
            "--> Advanced {} tick(s) of {:?}; now at tick #{} ({} path(s), {} task(s), {} timer(s)).",
            count,
            delta,
            last.tick_count.max(self.engine.tick_count()),
            self.engine.path_ids().len(),
            self.engine.tasks().len(),
            self.engine.timers().len()
        );
    }

    fn list(&mut self) {
        self.active_paths.retain(|_, id| self.engine.has_path(*id));
        println!("Active Paths:");
        for (handle, id) in &self.active_paths {
            println!("  Handle #{}: {:?}", handle, id);
        }
        println!("Named Tasks:");
        for key in self.engine.tasks().keys() {
            let remaining = self
                .engine
                .tasks()
                .inspect(&key, |state| state.remaining_secs())
                .unwrap_or_default();
            println!("  {} (next in {:.2}s)", key, remaining.max(0.0));
        }
        println!("Queued Timers: {}", self.engine.timers().len());
    }

    fn start_clock(&mut self) {
        if self.clock.is_some() {
            println!("--> The clock is already running.");
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_until(async { stop_rx.await.ok(); }).await {
                eprintln!("\nEngine stopped with an error: {}", e);
            }
        });
        self.clock = Some(stop_tx);
        println!("--> Clock started at {:?}.", self.engine.config().resolution);
    }

    fn stop_clock(&mut self) {
        match self.clock.take() {
            Some(stop_tx) => {
                stop_tx.send(()).ok();
                println!("--> Clock stopped.");
            }
            None => println!("--> The clock is not running."),
        }
    }
}

fn report_add(outcome: &AddOutcome) {
    match outcome {
        AddOutcome::Registered(key) => println!("--> Task '{}' scheduled.", key),
        AddOutcome::AlreadyPresent(key) => {
            println!("--> Task '{}' already exists; left untouched.", key)
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  task add <N> <S>               - Named one-shot task firing after S seconds.");
    println!("  task periodic <N> <S> <C|forever> - Named task firing every S seconds, C times.");
    println!("  task remove <N>                - Cancels a named task.");
    println!("  timer once <S> | every <S>     - Queues a delayed or repeating callback.");
    println!("  path wait <S>                  - Spawns a path that waits S seconds.");
    println!("  path remove <H>                - Removes a path by its handle.");
    println!("  tick [C] [S]                   - Advances C ticks of S seconds (default 1 x 0.1s).");
    println!("  start clock | stop clock       - Lets the engine tick itself in the background.");
    println!("  start ticks | stop ticks       - Toggles printing of every 5th tick.");
    println!("  list                           - Shows live paths, tasks and timers.");
    println!("  exit                           - Quits the shell.");
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let engine = TickflowEngine::new(TickflowConfig::load(None)?);

    // Create the shared flag for the tick listener.
    let is_listening_to_ticks = Arc::new(AtomicBool::new(false));
    spawn_event_listeners(&engine, is_listening_to_ticks.clone());
    info!("{} ready; ticks are manual until 'start clock'.", ENGINE_NAME.cyan());

    let mut state = ShellState {
        engine,
        active_paths: HashMap::new(),
        next_handle: 0,
        clock: None,
    };

    let mut rl = Editor::new()?;
    rl.set_helper(Some(MyHighlighter {}));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();

                if let Some(command) = args.first() {
                    match (*command, args.get(1).copied()) {
                        ("task", _) => state.handle_task(&args),
                        ("timer", _) => state.handle_timer(&args),
                        ("path", _) => state.handle_path(&args),
                        ("tick", _) => state.handle_tick(&args),
                        ("list", _) => state.list(),
                        ("start", Some("clock")) => state.start_clock(),
                        ("stop", Some("clock")) => state.stop_clock(),
                        ("start", Some("ticks")) => {
                            is_listening_to_ticks.store(true, Ordering::Relaxed);
                            println!("--> Started listening to the tick stream.");
                        }
                        ("stop", Some("ticks")) => {
                            is_listening_to_ticks.store(false, Ordering::Relaxed);
                            println!("--> Stopped listening to the tick stream.");
                        }
                        ("help", _) => print_help(),
                        ("exit", _) => break,
                        _ => println!("Unknown command: '{}'. Type 'help'.", line),
                    }
                }
            }
            Err(_) => {
                println!("Exiting tickshell...");
                break;
            }
        }
    }

    state.stop_clock();
    Ok(())
}
