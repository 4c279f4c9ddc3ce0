//! Cross-thread control flags: master enable, pause and stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::clock::Clock;

/// Pause polling quantum of the cooperative check.
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Why a running macro has to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Disabled,
    Inactive,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort(AbortReason),
}

/// Wall-clock bookkeeping of pauses, so sleeps can be extended by the time
/// spent paused while they ran.
#[derive(Debug, Default)]
struct PauseState {
    since: Option<Instant>,
    total: Duration,
}

impl PauseState {
    fn is_paused(&self) -> bool {
        self.since.is_some()
    }

    fn set(&mut self, paused: bool) {
        match (self.since, paused) {
            (None, true) => self.since = Some(Instant::now()),
            (Some(since), false) => {
                self.total += since.elapsed();
                self.since = None;
            }
            _ => {}
        }
    }

    fn paused_for(&self) -> Duration {
        self.total + self.since.map(|since| since.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct EngineControl {
    enabled: AtomicBool,
    stop: AtomicBool,
    paused: Mutex<PauseState>,
    resumed: Condvar,
}

impl EngineControl {
    pub fn new(enabled: bool) -> Self {
        EngineControl {
            enabled: AtomicBool::new(enabled),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.lock().is_paused()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.lock().set(paused);
        if !paused {
            self.resumed.notify_all();
        }
    }

    /// Flip pause and return the new state.
    pub fn toggle_pause(&self) -> bool {
        let mut state = self.paused.lock();
        let now = !state.is_paused();
        state.set(now);
        drop(state);
        if !now {
            self.resumed.notify_all();
        }
        now
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.resumed.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Consume a pending stop. Returns whether one was pending.
    pub fn clear_stop(&self) -> bool {
        self.stop.swap(false, Ordering::SeqCst)
    }

    fn abort_reason(&self, active: &AtomicBool) -> Option<AbortReason> {
        if self.stop_requested() {
            Some(AbortReason::Stopped)
        } else if !self.is_enabled() {
            Some(AbortReason::Disabled)
        } else if !active.load(Ordering::SeqCst) {
            Some(AbortReason::Inactive)
        } else {
            None
        }
    }

    /// The point between actions where pause, stop, master enable and the
    /// macro's own active flag are observed. Blocks while paused.
    pub fn cooperative_check(&self, active: &AtomicBool) -> Flow {
        if let Some(reason) = self.abort_reason(active) {
            return Flow::Abort(reason);
        }

        let mut state = self.paused.lock();
        while state.is_paused() {
            if let Some(reason) = self.abort_reason(active) {
                return Flow::Abort(reason);
            }
            self.resumed.wait_for(&mut state, PAUSE_POLL);
        }
        drop(state);

        match self.abort_reason(active) {
            Some(reason) => Flow::Abort(reason),
            None => Flow::Continue,
        }
    }

    /// Sleep for `duration` on `clock`, then hold while paused. Any pause
    /// overlapping the sleep is slept again afterwards, so a paused macro
    /// never gets ahead of its wall-clock budget.
    pub fn sleep_observing(&self, clock: &dyn Clock, duration: Duration, active: &AtomicBool) -> Flow {
        let mut remaining = duration;
        while !remaining.is_zero() {
            let before = self.paused.lock().paused_for();
            clock.sleep(remaining);
            remaining = self.paused.lock().paused_for().saturating_sub(before);
            if let Flow::Abort(reason) = self.cooperative_check(active) {
                return Flow::Abort(reason);
            }
        }
        Flow::Continue
    }
}
