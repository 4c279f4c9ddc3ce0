//! Progress and ETA reporting.
//!
//! The worker updates a shared [`ProgressTracker`] as it walks a macro; a
//! separate [`ProgressReporter`] thread posts snapshots to the UI once per
//! second, so bars keep moving during long sleeps.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::clock::{Clock, seconds};
use crate::config::Settings;
use crate::error::Result;
use crate::plan::{Action, MacroDef, WaitDuration};

/// How many recent iterations feed the running average.
const RECENT_ITERATIONS: usize = 5;

/// Cadence of UI progress updates.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Static estimate of one procedure: a number of interactive steps plus any
/// intrinsic waiting.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureEstimate {
    pub steps: usize,
    pub intrinsic: Duration,
}

impl ProcedureEstimate {
    /// A crafting procedure waits `crafts × ticks_per_craft × tick_time`.
    pub fn crafting(steps: usize, crafts: u32, ticks_per_craft: u32, tick_time: f64) -> Self {
        ProcedureEstimate {
            steps,
            intrinsic: seconds(crafts as f64 * ticks_per_craft as f64 * tick_time),
        }
    }

    /// Estimate for one iteration of `def` under `settings`.
    pub fn for_macro(def: &MacroDef, settings: &Settings) -> Self {
        let mut intrinsic = 0.0;
        for step in &def.actions {
            match &step.action {
                Action::Wait { duration } => {
                    intrinsic += match duration {
                        WaitDuration::Seconds(secs) => *secs,
                        WaitDuration::Named(name) => settings.wait_times.get(name).copied().unwrap_or(0.0),
                    }
                }
                Action::Click { positions, .. } => {
                    intrinsic += settings.mouse_move_duration * positions.len().max(1) as f64;
                }
                Action::ReturnMouse { .. } => intrinsic += settings.mouse_move_duration,
                _ => {}
            }
        }
        ProcedureEstimate {
            steps: def.actions.len(),
            intrinsic: seconds(intrinsic),
        }
    }

    pub fn duration(&self, average_interaction_wait: f64, interface_wait: f64) -> Duration {
        seconds(self.steps as f64 * (average_interaction_wait + interface_wait)) + self.intrinsic
    }
}

/// What the UI shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub macro_name: Option<String>,
    /// Fraction of the current procedure (iteration) done, 0..=1.
    pub current: f64,
    /// Fraction of the whole run done; `None` for unbounded loops.
    pub overall: Option<f64>,
    pub current_eta: Option<Duration>,
    pub overall_eta: Option<Duration>,
    pub iteration: u64,
    pub iterations: Option<u64>,
}

impl ProgressSnapshot {
    pub fn is_idle(&self) -> bool {
        self.macro_name.is_none()
    }
}

/// `N/A` for unknown, otherwise `1h02m03s` / `2m03s` / `3s`.
pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "N/A".into();
    };
    let total = eta.as_secs_f64().ceil() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[derive(Debug)]
struct RunState {
    macro_name: String,
    started: Instant,
    iteration_started: Instant,
    steps_total: usize,
    steps_done: usize,
    iteration: u64,
    iterations: Option<u64>,
    estimate_iteration: Duration,
    recent: VecDeque<Duration>,
}

/// Shared progress state written by the worker and read by the reporter.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<Option<RunState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&self, name: &str, estimate: &ProcedureEstimate, per_step: Duration, iterations: Option<u64>, now: Instant) {
        *self.state.lock() = Some(RunState {
            macro_name: name.to_string(),
            started: now,
            iteration_started: now,
            steps_total: estimate.steps,
            steps_done: 0,
            iteration: 0,
            iterations,
            estimate_iteration: per_step.saturating_mul(estimate.steps as u32).saturating_add(estimate.intrinsic),
            recent: VecDeque::with_capacity(RECENT_ITERATIONS),
        });
    }

    pub fn begin_iteration(&self, index: u64, now: Instant) {
        if let Some(state) = self.state.lock().as_mut() {
            state.iteration = index;
            state.iteration_started = now;
            state.steps_done = 0;
        }
    }

    pub fn step_done(&self) {
        if let Some(state) = self.state.lock().as_mut() {
            state.steps_done = (state.steps_done + 1).min(state.steps_total);
        }
    }

    /// Record a finished iteration; returns the running average of the last
    /// few iteration durations, which becomes the new per-iteration estimate.
    pub fn end_iteration(&self, now: Instant) -> Option<Duration> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;
        if state.recent.len() == RECENT_ITERATIONS {
            state.recent.pop_front();
        }
        state.recent.push_back(now.saturating_duration_since(state.iteration_started));
        let average = state.recent.iter().sum::<Duration>() / state.recent.len() as u32;
        state.estimate_iteration = average;
        state.steps_done = state.steps_total;
        Some(average)
    }

    /// Forget the run; the UI goes back to "N/A".
    pub fn finish(&self) {
        *self.state.lock() = None;
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let guard = self.state.lock();
        let Some(state) = guard.as_ref() else {
            return ProgressSnapshot::default();
        };

        let current = if state.steps_total == 0 {
            0.0
        } else {
            state.steps_done as f64 / state.steps_total as f64
        };
        let overall = state
            .iterations
            .filter(|n| *n > 0)
            .map(|n| ((state.iteration as f64 + current) / n as f64).min(1.0));

        let elapsed_iteration = now.saturating_duration_since(state.iteration_started);
        let current_eta = state.estimate_iteration.saturating_sub(elapsed_iteration);
        let overall_eta = state.iterations.map(|n| {
            let total = state
                .estimate_iteration
                .checked_mul(n.min(u32::MAX as u64) as u32)
                .unwrap_or(Duration::MAX);
            total.saturating_sub(now.saturating_duration_since(state.started))
        });

        ProgressSnapshot {
            macro_name: Some(state.macro_name.clone()),
            current,
            overall,
            current_eta: Some(current_eta),
            overall_eta,
            iteration: state.iteration,
            iterations: state.iterations,
        }
    }
}

/// Receiver of UI updates. Implementations must not block.
pub trait UiSink: Send + Sync + 'static {
    fn post(&self, snapshot: ProgressSnapshot);
}

impl UiSink for Sender<ProgressSnapshot> {
    fn post(&self, snapshot: ProgressSnapshot) {
        let _ = self.try_send(snapshot);
    }
}

/// Background thread posting a snapshot every `interval`.
pub struct ProgressReporter {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(
        tracker: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn UiSink>,
        interval: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("progress".into())
            .spawn(move || {
                loop {
                    sink.post(tracker.snapshot(clock.now()));
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(ProgressReporter {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
