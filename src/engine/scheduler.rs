//! Interval timers for scheduled macros.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use super::{EngineControl, MacroRuntime, Submitter};
use crate::error::Result;

/// Dropping the sender disconnects the timer thread, which then exits.
struct Timer {
    _cancel: Sender<()>,
    generation: u64,
}

type Timers = Arc<Mutex<HashMap<String, Timer>>>;

/// At most one timer per macro name.
#[derive(Default)]
pub struct Scheduler {
    timers: Timers,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `runtime` now and then every `interval` while it stays active
    /// and the engine stays enabled. Replaces any timer already running for
    /// the same macro.
    pub(crate) fn start(
        &self,
        runtime: Arc<MacroRuntime>,
        interval: Duration,
        control: Arc<EngineControl>,
        submitter: Submitter,
    ) -> Result<()> {
        let name = runtime.name().to_string();
        let mut timers = self.timers.lock();
        if timers.remove(&name).is_some() {
            tracing::debug!(macro_name = %name, "Replacing schedule");
        }

        // The first fire happens before returning.
        if !fire(&runtime, &control, &submitter) {
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::clone(&self.timers);
        thread::Builder::new()
            .name(format!("schedule_{}", name))
            .spawn(move || {
                tracing::info!(macro_name = runtime.name(), "Scheduled every {:?}", interval);
                loop {
                    match cancel_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Cancelled or replaced; the entry is already gone.
                        _ => return,
                    }
                    if !fire(&runtime, &control, &submitter) {
                        break;
                    }
                }
                let mut timers = registry.lock();
                if timers.get(runtime.name()).is_some_and(|t| t.generation == generation) {
                    timers.remove(runtime.name());
                }
            })?;

        timers.insert(
            name,
            Timer {
                _cancel: cancel_tx,
                generation,
            },
        );
        Ok(())
    }

    pub fn cancel(&self, name: &str) {
        if self.timers.lock().remove(name).is_some() {
            tracing::debug!(macro_name = name, "Schedule cancelled");
        }
    }

    pub fn cancel_all(&self) {
        self.timers.lock().clear();
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.timers.lock().contains_key(name)
    }
}

/// Enqueue one run unless the schedule should end.
fn fire(runtime: &Arc<MacroRuntime>, control: &EngineControl, submitter: &Submitter) -> bool {
    if !control.is_enabled() {
        tracing::info!(macro_name = runtime.name(), "Schedule ended: engine disabled");
        return false;
    }
    if !runtime.is_active() {
        tracing::info!(macro_name = runtime.name(), "Schedule ended: macro inactive");
        return false;
    }
    submitter.submit(runtime);
    true
}
