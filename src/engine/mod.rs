//! Macro execution engine
//!
//! Every way of starting a macro (hotkeys, UI buttons, the scheduler) ends
//! up as an entry in one FIFO queue drained by a single worker thread, so
//! macros never run concurrently.

pub mod control;
mod executor;
mod scheduler;

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::clock::{Clock, seconds};
use crate::config::ConfigStore;
use crate::effector::InputEffector;
use crate::error::{MacroError, Result};
use crate::hotkey::HotkeyTarget;
use crate::plan::{MacroDef, validate_catalog};
use crate::progress::ProgressTracker;

pub use control::{AbortReason, EngineControl, Flow, PAUSE_POLL};
use executor::Executor;
pub use scheduler::Scheduler;

/// Engine-level commands bound to fixed hotkeys or UI buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Set the master enable flag.
    Start,
    TogglePause,
    /// Clear master enable, abort the running macro and drop the queue.
    Stop,
    StartMacro(String),
    StopMacro(String),
}

/// Dose-cycling counters of one macro.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoseState {
    pub call_count: u64,
    pub position_index: usize,
}

/// A loaded macro: the read-only definition plus its runtime fields.
#[derive(Debug)]
pub struct MacroRuntime {
    def: MacroDef,
    dose: Mutex<DoseState>,
    active: AtomicBool,
    running: AtomicBool,
    loop_index: AtomicU64,
    /// Entries currently sitting in the queue.
    queued: AtomicUsize,
    /// Serializes activation against end-of-run deactivation.
    gate: Mutex<()>,
}

impl MacroRuntime {
    pub fn new(def: MacroDef) -> Self {
        let dose = DoseState {
            call_count: def.call_count,
            position_index: def.current_position_index,
        };
        MacroRuntime {
            def,
            dose: Mutex::new(dose),
            active: AtomicBool::new(false),
            running: AtomicBool::new(false),
            loop_index: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            gate: Mutex::new(()),
        }
    }

    pub fn def(&self) -> &MacroDef {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_loop_index(&self) -> u64 {
        self.loop_index.load(Ordering::SeqCst)
    }

    pub fn dose_state(&self) -> DoseState {
        *self.dose.lock()
    }

    pub(crate) fn active_flag(&self) -> &AtomicBool {
        &self.active
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Count one click execution of a dose macro and advance the position
    /// index every `dose_count` executions. Returns the new state.
    fn bump_dose(&self, dose_count: u32) -> DoseState {
        let cycle = self.def.max_positions_len();
        let mut dose = self.dose.lock();
        dose.call_count += 1;
        if cycle > 0 && dose_count > 0 && dose.call_count % dose_count as u64 == 0 {
            dose.position_index = (dose.position_index + 1) % cycle;
        }
        *dose
    }

    fn reset_runtime(&self) {
        self.set_active(false);
        self.running.store(false, Ordering::SeqCst);
        self.loop_index.store(0, Ordering::SeqCst);
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Inactive,
}

/// Notifications for the UI log panel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started { name: String },
    Finished { name: String, outcome: Outcome },
    Skipped { name: String, reason: SkipReason },
    ActionSkipped { name: String, reason: String },
    IterationFinished { name: String, index: u64, average: Duration },
    Failed { name: String, error: String },
}

enum Job {
    Run(Arc<MacroRuntime>),
    Shutdown,
}

/// Number of submitted but unfinished executions.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Handle used by everything that enqueues work.
#[derive(Clone)]
pub(crate) struct Submitter {
    tx: Sender<Job>,
    pending: Arc<Pending>,
}

impl Submitter {
    pub(crate) fn submit(&self, runtime: &Arc<MacroRuntime>) {
        runtime.queued.fetch_add(1, Ordering::SeqCst);
        self.pending.add();
        if self.tx.send(Job::Run(Arc::clone(runtime))).is_err() {
            runtime.queued.fetch_sub(1, Ordering::SeqCst);
            self.pending.done();
            tracing::error!("Execution queue is closed, dropping {:?}", runtime.name());
        } else {
            tracing::debug!(macro_name = runtime.name(), "Queued");
        }
    }
}

pub struct Engine {
    control: Arc<EngineControl>,
    store: Arc<ConfigStore>,
    clock: Arc<dyn Clock>,
    catalog: RwLock<Vec<Arc<MacroRuntime>>>,
    submitter: Submitter,
    queue: Receiver<Job>,
    scheduler: Scheduler,
    progress: Arc<ProgressTracker>,
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
    catalog_watchers: Mutex<Vec<CatalogWatcher>>,
    worker_started: AtomicBool,
}

type CatalogWatcher = Box<dyn Fn(&[MacroDef]) + Send + Sync>;

/// Same definition apart from the persisted dose counters.
fn same_plan(a: &MacroDef, b: &MacroDef) -> bool {
    let mut b = b.clone();
    b.call_count = a.call_count;
    b.current_position_index = a.current_position_index;
    *a == b
}

impl Engine {
    /// Build an engine over the macros in `store`. The master enable flag
    /// starts off; call [`Engine::start`] to arm it.
    pub fn new(store: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let engine = Arc::new(Engine {
            control: Arc::new(EngineControl::new(false)),
            store,
            clock,
            catalog: RwLock::new(Vec::new()),
            submitter: Submitter {
                tx,
                pending: Arc::new(Pending::default()),
            },
            queue: rx,
            scheduler: Scheduler::new(),
            progress: Arc::new(ProgressTracker::new()),
            subscribers: Mutex::new(Vec::new()),
            catalog_watchers: Mutex::new(Vec::new()),
            worker_started: AtomicBool::new(false),
        });
        engine.reload_catalog();
        engine
    }

    pub fn control(&self) -> &EngineControl {
        &self.control
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Rebuild the runtime records from the configuration. Macros that fail
    /// validation are left out with a warning. Unchanged macros keep their
    /// runtime state; changed or removed ones are deactivated and their
    /// schedules cancelled. Catalog watchers see the new list afterwards.
    pub fn reload_catalog(&self) {
        let mut defs = self.store.macros();
        if let Err(e) = validate_catalog(&defs) {
            tracing::warn!("Macro catalog has problems ({}), loading valid macros only", e);
            let mut seen = HashSet::new();
            defs.retain(|d| match d.validate() {
                Ok(()) => seen.insert(d.name.clone()),
                Err(e) => {
                    tracing::warn!("Skipping macro {:?}: {}", d.name, e);
                    false
                }
            });
        }

        let mut catalog = self.catalog.write();
        let mut kept = 0;
        let runtimes: Vec<Arc<MacroRuntime>> = defs
            .iter()
            .map(|d| match catalog.iter().find(|old| same_plan(old.def(), d)) {
                Some(old) => {
                    kept += 1;
                    Arc::clone(old)
                }
                None => Arc::new(MacroRuntime::new(d.clone())),
            })
            .collect();
        for old in catalog.iter() {
            if !runtimes.iter().any(|r| Arc::ptr_eq(r, old)) {
                tracing::debug!(macro_name = old.name(), "Retiring macro");
                old.set_active(false);
                self.scheduler.cancel(old.name());
            }
        }
        *catalog = runtimes;
        drop(catalog);

        tracing::info!("Loaded {} macros ({} unchanged)", defs.len(), kept);
        for watcher in self.catalog_watchers.lock().iter() {
            watcher(&defs);
        }
    }

    /// Call `watcher` with the loaded macros now and after every reload.
    pub fn watch_catalog(&self, watcher: impl Fn(&[MacroDef]) + Send + Sync + 'static) {
        let mut watchers = self.catalog_watchers.lock();
        let defs: Vec<MacroDef> = self.macros().iter().map(|r| r.def().clone()).collect();
        watcher(&defs);
        watchers.push(Box::new(watcher));
    }

    /// Validate and store a new or edited macro, then reload the catalog.
    pub fn publish_macro(&self, def: MacroDef, replacing: Option<&str>) -> Result<()> {
        let name = def.name.clone();
        self.store.upsert_macro(def, replacing)?;
        tracing::info!("Published macro {:?}", name);
        self.reload_catalog();
        Ok(())
    }

    /// Delete a macro from the configuration and the catalog.
    pub fn remove_macro(&self, name: &str) -> bool {
        if !self.store.remove_macro(name) {
            return false;
        }
        tracing::info!("Removed macro {:?}", name);
        self.reload_catalog();
        true
    }

    pub fn find_macro(&self, name: &str) -> Option<Arc<MacroRuntime>> {
        self.catalog.read().iter().find(|m| m.name() == name).cloned()
    }

    pub fn macros(&self) -> Vec<Arc<MacroRuntime>> {
        self.catalog.read().clone()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    /// Arm the master enable flag and clear any pause.
    pub fn start(&self) {
        self.control.set_paused(false);
        self.control.set_enabled(true);
        tracing::info!("Engine started");
    }

    /// Disarm everything: abort the running macro at its next check, cancel
    /// schedules, deactivate every macro and drop queued entries.
    pub fn stop(&self) {
        self.control.set_enabled(false);
        self.control.request_stop();
        self.scheduler.cancel_all();
        for runtime in self.catalog.read().iter() {
            runtime.set_active(false);
        }
        let mut dropped = 0;
        let mut shutdown = false;
        while let Ok(job) = self.queue.try_recv() {
            match job {
                Job::Run(runtime) => {
                    runtime.queued.fetch_sub(1, Ordering::SeqCst);
                    self.submitter.pending.done();
                    dropped += 1;
                }
                Job::Shutdown => shutdown = true,
            }
        }
        if shutdown {
            // The worker still has to see it.
            let _ = self.submitter.tx.send(Job::Shutdown);
        }
        tracing::info!("Engine stopped, dropped {} queued macros", dropped);
    }

    pub fn toggle_pause(&self) -> bool {
        let paused = self.control.toggle_pause();
        tracing::info!("Engine {}", if paused { "paused" } else { "resumed" });
        paused
    }

    /// Queue one execution without touching the macro's active flag; the
    /// worker skips it unless the macro is active when dequeued.
    pub fn submit(&self, name: &str) -> Result<()> {
        let runtime = self
            .find_macro(name)
            .ok_or_else(|| MacroError::UnknownMacro(name.to_string()))?;
        let _gate = runtime.gate.lock();
        self.submitter.submit(&runtime);
        Ok(())
    }

    /// Mark a macro active and queue it, or arm its timer when scheduled.
    pub fn start_macro(&self, name: &str) -> Result<()> {
        let runtime = self
            .find_macro(name)
            .ok_or_else(|| MacroError::UnknownMacro(name.to_string()))?;
        let _gate = runtime.gate.lock();
        runtime.set_active(true);
        if runtime.def.is_scheduled {
            let interval = runtime.def.interval()?;
            self.scheduler.start(
                Arc::clone(&runtime),
                interval.as_duration(),
                Arc::clone(&self.control),
                self.submitter.clone(),
            )?;
        } else {
            self.submitter.submit(&runtime);
        }
        Ok(())
    }

    pub fn stop_macro(&self, name: &str) -> Result<()> {
        let runtime = self
            .find_macro(name)
            .ok_or_else(|| MacroError::UnknownMacro(name.to_string()))?;
        runtime.set_active(false);
        self.scheduler.cancel(name);
        tracing::info!("Stopped macro {:?}", name);
        Ok(())
    }

    pub fn execute(&self, command: EngineCommand) -> Result<()> {
        match command {
            EngineCommand::Start => self.start(),
            EngineCommand::TogglePause => {
                self.toggle_pause();
            }
            EngineCommand::Stop => self.stop(),
            EngineCommand::StartMacro(name) => self.start_macro(&name)?,
            EngineCommand::StopMacro(name) => self.stop_macro(&name)?,
        }
        Ok(())
    }

    /// Block until every submitted execution has finished or been dropped.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.submitter.pending.wait_idle(timeout)
    }

    /// Ask the worker to exit after the entries already queued.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
        let _ = self.submitter.tx.send(Job::Shutdown);
    }

    /// Start the single worker thread. `make_effector` runs on that thread so
    /// the effector never has to cross threads; its failure is returned here.
    pub fn spawn_worker<E, F>(self: &Arc<Self>, make_effector: F) -> Result<thread::JoinHandle<()>>
    where
        E: InputEffector + 'static,
        F: FnOnce() -> Result<E> + Send + 'static,
    {
        if self.worker_started.swap(true, Ordering::SeqCst) {
            return Err(MacroError::Config("The engine worker is already running".into()));
        }

        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("engine_worker".into())
            .spawn(move || {
                let mut effector = match make_effector() {
                    Ok(effector) => {
                        let _ = ready_tx.send(Ok(()));
                        effector
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                engine.run_worker(&mut effector);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                self.worker_started.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.worker_started.store(false, Ordering::SeqCst);
                Err(MacroError::Input("Engine worker exited during start-up".into()))
            }
        }
    }

    fn run_worker<E: InputEffector>(&self, effector: &mut E) {
        tracing::info!("Engine worker running");
        for job in self.queue.iter() {
            let runtime = match job {
                Job::Run(runtime) => runtime,
                Job::Shutdown => break,
            };
            runtime.queued.fetch_sub(1, Ordering::SeqCst);
            let executed = self.process(effector, &runtime);
            if executed {
                let delay = seconds(self.store.settings().task_queue_delay);
                if !delay.is_zero() {
                    self.clock.sleep(delay);
                }
            }
            self.submitter.pending.done();
        }
        tracing::info!("Engine worker exiting");
    }

    /// Run one dequeued macro. Returns whether it actually executed.
    fn process<E: InputEffector>(&self, effector: &mut E, runtime: &Arc<MacroRuntime>) -> bool {
        let name = runtime.name().to_string();
        if !self.control.is_enabled() {
            tracing::info!(macro_name = %name, "Skipped: engine is disabled");
            self.emit(EngineEvent::Skipped {
                name,
                reason: SkipReason::Disabled,
            });
            return false;
        }
        if !runtime.is_active() {
            tracing::info!(macro_name = %name, "Skipped: macro is not active");
            self.emit(EngineEvent::Skipped {
                name,
                reason: SkipReason::Inactive,
            });
            return false;
        }

        // A stop issued before this entry was picked up is stale.
        self.control.clear_stop();
        runtime.running.store(true, Ordering::SeqCst);
        tracing::info!(macro_name = %name, "Running");
        self.emit(EngineEvent::Started { name: name.clone() });

        let result = catch_unwind(AssertUnwindSafe(|| Executor::new(self, effector, runtime).run()));

        runtime.running.store(false, Ordering::SeqCst);
        self.progress.finish();

        let failure = match result {
            Ok(Ok(outcome)) => {
                match outcome {
                    Outcome::Completed => {
                        tracing::info!(macro_name = %name, "Finished");
                        let _gate = runtime.gate.lock();
                        let more_queued = runtime.queued.load(Ordering::SeqCst) > 0;
                        if !runtime.def.is_scheduled && !more_queued {
                            runtime.reset_runtime();
                        }
                    }
                    Outcome::Aborted(reason) => {
                        tracing::info!(macro_name = %name, ?reason, "Aborted");
                        if reason == AbortReason::Stopped {
                            self.control.clear_stop();
                        }
                        runtime.reset_runtime();
                        self.scheduler.cancel(&name);
                    }
                }
                self.emit(EngineEvent::Finished { name: name.clone(), outcome });
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        if let Some(error) = failure {
            tracing::error!(macro_name = %name, "Macro failed: {}", error);
            runtime.reset_runtime();
            self.scheduler.cancel(&name);
            self.emit(EngineEvent::Failed { name, error });
        }
        true
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

impl HotkeyTarget for Engine {
    fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    fn run_command(&self, command: EngineCommand) {
        if let Err(e) = self.execute(command) {
            tracing::warn!("Hotkey command failed: {}", e);
        }
    }

    fn start_macro(&self, name: &str) {
        if let Err(e) = Engine::start_macro(self, name) {
            tracing::warn!("Could not start {:?}: {}", name, e);
        }
    }
}
