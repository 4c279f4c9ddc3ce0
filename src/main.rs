//! tickmacro - tick-synchronous desktop macro runner

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tickmacro::clock::{Clock, SystemClock};
use tickmacro::config::{AUTOSAVE_INTERVAL, Autosave, ConfigStore, default_config_path};
use tickmacro::effector::EnigoEffector;
use tickmacro::engine::{Engine, EngineEvent};
use tickmacro::hotkey::{HotkeyDispatcher, HotkeyTarget, bindings_for};
use tickmacro::interval::Interval;
use tickmacro::notification::notify_invalid;
use tickmacro::plan::validate_catalog;
use tickmacro::positions::{DeviceQuerySource, PositionStore};
use tickmacro::progress::{ProgressReporter, ProgressSnapshot, REPORT_INTERVAL, UiSink, format_eta};

/// tickmacro - tick-synchronous desktop macro runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen for hotkeys and run macros until Ctrl+C
    Run,
    /// List the configured macros
    List,
    /// Validate every macro in the configuration
    Validate,
    /// Store the pointer position of the next mouse click under a name
    Capture {
        name: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Parse a schedule interval such as "1h30m"
    Interval { text: String },
    /// Run one macro and exit when the queue is empty
    Start { name: String },
}

static RUNNING: AtomicBool = AtomicBool::new(true);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let path = args.config.unwrap_or_else(default_config_path);
    match args.command.unwrap_or(Commands::Run) {
        Commands::Interval { text } => {
            let interval: Interval = text.parse()?;
            println!("{} ({} seconds)", interval, interval.as_secs());
            Ok(())
        }
        Commands::List => list(&ConfigStore::open(&path)),
        Commands::Validate => validate(&ConfigStore::open(&path)),
        Commands::Capture { name, timeout } => {
            let store = ConfigStore::open(&path);
            println!("Click anywhere to capture {:?}...", name);
            let timeout = timeout.map(Duration::from_secs_f64);
            let coord = PositionStore::new(store).capture(&name, DeviceQuerySource, timeout)?;
            println!("✓ Saved {} at {}", name, coord);
            Ok(())
        }
        Commands::Start { name } => start_once(ConfigStore::open(&path), &name),
        Commands::Run => run_daemon(ConfigStore::open(&path)),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn list(store: &ConfigStore) -> anyhow::Result<()> {
    let macros = store.macros();
    if macros.is_empty() {
        println!("No macros configured in {}", store.path().display());
        return Ok(());
    }
    for def in macros {
        let hotkey = def.hotkey.as_deref().unwrap_or("-");
        let mut flags = Vec::new();
        if let Some(dose) = def.dose() {
            flags.push(format!("dose every {}", dose));
        }
        match def.iterations() {
            None => flags.push("loops forever".to_string()),
            Some(n) if def.is_loop_macro => flags.push(format!("loops {}x", n)),
            _ => {}
        }
        if def.is_scheduled {
            flags.push(format!("every {}", def.schedule_interval.as_deref().unwrap_or("?")));
        }
        println!("{:<24} {:<12} {} actions {}", def.name, hotkey, def.actions.len(), flags.join(", "));
    }
    Ok(())
}

fn validate(store: &ConfigStore) -> anyhow::Result<()> {
    let settings = store.settings();
    if let Err(e) = settings.validate() {
        notify_invalid("Settings", &e);
        bail!("invalid settings: {}", e);
    }
    let macros = store.macros();
    let mut failures = 0;
    for def in &macros {
        if let Err(e) = def.validate() {
            notify_invalid(&format!("Macro {:?}", def.name), &e);
            failures += 1;
        }
    }
    if let Err(e) = validate_catalog(&macros) {
        if failures == 0 {
            notify_invalid("Macro catalog", &e);
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{} problem(s) in {}", failures, store.path().display());
    }
    println!("✓ {} macros are valid", macros.len());
    Ok(())
}

fn start_engine(store: Arc<ConfigStore>) -> anyhow::Result<Arc<Engine>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Engine::new(store, clock);
    engine
        .spawn_worker(EnigoEffector::new)
        .context("failed to start the input worker")?;
    spawn_event_logger(&engine)?;
    Ok(engine)
}

fn start_once(store: Arc<ConfigStore>, name: &str) -> anyhow::Result<()> {
    let engine = start_engine(Arc::clone(&store))?;
    engine.start();
    engine.start_macro(name)?;
    while !engine.wait_idle(Duration::from_millis(200)) {}
    engine.shutdown();
    store.force_flush().context("failed to save the configuration")?;
    Ok(())
}

/// Headless stand-in for the progress bars.
struct LogSink;

impl UiSink for LogSink {
    fn post(&self, snapshot: ProgressSnapshot) {
        if let Some(name) = &snapshot.macro_name {
            tracing::debug!(
                macro_name = %name,
                "{:.0}% (ETA {}), overall {} (ETA {})",
                snapshot.current * 100.0,
                format_eta(snapshot.current_eta),
                snapshot
                    .overall
                    .map(|f| format!("{:.0}%", f * 100.0))
                    .unwrap_or_else(|| "N/A".into()),
                format_eta(snapshot.overall_eta)
            );
        }
    }
}

fn spawn_event_logger(engine: &Arc<Engine>) -> anyhow::Result<()> {
    let events = engine.subscribe();
    std::thread::Builder::new()
        .name("event_log".into())
        .spawn(move || {
            for event in events {
                match event {
                    EngineEvent::Failed { name, error } => println!("✗ {}: {}", name, error),
                    EngineEvent::Finished { name, outcome } => println!("✓ {}: {:?}", name, outcome),
                    EngineEvent::Skipped { name, reason } => println!("- {} skipped ({:?})", name, reason),
                    _ => {}
                }
            }
        })?;
    Ok(())
}

fn run_daemon(store: Arc<ConfigStore>) -> anyhow::Result<()> {
    println!("tickmacro started ({})", store.path().display());
    println!("  Alt+X - Enable macros");
    println!("  Alt+C - Pause / resume");
    println!("  F1    - Stop everything");

    ctrlc::set_handler(|| {
        println!("\nShutting down...");
        RUNNING.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let autosave = Autosave::spawn(Arc::clone(&store), AUTOSAVE_INTERVAL)?;
    let engine = start_engine(Arc::clone(&store))?;
    let reporter = ProgressReporter::spawn(engine.progress(), engine.clock(), Arc::new(LogSink), REPORT_INTERVAL)?;

    let target: Arc<dyn HotkeyTarget> = engine.clone();
    let dispatcher = HotkeyDispatcher::new(target);
    let registrar = Arc::clone(&dispatcher);
    engine.watch_catalog(move |macros| {
        let bindings = bindings_for(macros);
        for (chord, action) in &bindings {
            tracing::debug!("{} -> {:?}", chord, action);
        }
        registrar.register(bindings);
    });
    dispatcher.spawn_listener()?;

    println!("Running (Ctrl+C to quit)...");
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    engine.stop();
    engine.shutdown();
    reporter.shutdown();
    autosave.shutdown();
    if let Err(e) = store.force_flush() {
        tracing::error!("Final save failed: {}", e);
        bail!("could not save {}", store.path().display());
    }
    Ok(())
}
