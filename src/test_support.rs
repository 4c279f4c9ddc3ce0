//! Recording effector and virtual clock for tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::effector::InputEffector;
use crate::error::{MacroError, Result};
use crate::keys::KeySpec;
use crate::plan::Coordinate;

type Hook = Box<dyn FnMut(&str) + Send>;

struct Inner {
    trace: Mutex<Vec<String>>,
    base: Instant,
    elapsed: Mutex<Duration>,
    pointer: Mutex<Coordinate>,
    hook: Mutex<Option<Hook>>,
    fail_on: Mutex<Option<String>>,
}

/// Logs every input event as a string and advances a virtual clock on
/// sleep instead of blocking. Clones share the same log.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            inner: Arc::new(Inner {
                trace: Mutex::new(Vec::new()),
                base: Instant::now(),
                elapsed: Mutex::new(Duration::ZERO),
                pointer: Mutex::new(Coordinate::new(0, 0)),
                hook: Mutex::new(None),
                fail_on: Mutex::new(None),
            }),
        }
    }

    pub fn trace(&self) -> Vec<String> {
        self.inner.trace.lock().clone()
    }

    pub fn clear(&self) {
        self.inner.trace.lock().clear();
    }

    /// Virtual time spent sleeping so far.
    pub fn elapsed(&self) -> Duration {
        *self.inner.elapsed.lock()
    }

    pub fn set_pointer(&self, at: Coordinate) {
        *self.inner.pointer.lock() = at;
    }

    /// Called after each recorded event, on the thread that produced it.
    pub fn on_event(&self, hook: impl FnMut(&str) + Send + 'static) {
        *self.inner.hook.lock() = Some(Box::new(hook));
    }

    /// Make the effector fail instead of producing `event`.
    pub fn fail_on(&self, event: &str) {
        *self.inner.fail_on.lock() = Some(event.to_string());
    }

    fn record(&self, event: String) -> Result<()> {
        if self.inner.fail_on.lock().as_deref() == Some(event.as_str()) {
            return Err(MacroError::Input(format!("injected failure on {}", event)));
        }
        self.inner.trace.lock().push(event.clone());
        if let Some(hook) = self.inner.hook.lock().as_mut() {
            hook(&event);
        }
        Ok(())
    }
}

impl InputEffector for Recorder {
    fn move_to(&mut self, target: Coordinate, duration: Duration) -> Result<()> {
        self.record(format!("move {} duration={}", target, duration.as_secs_f64()))?;
        *self.inner.pointer.lock() = target;
        Ok(())
    }

    fn click(&mut self) -> Result<()> {
        self.record("click".to_string())
    }

    fn key_down(&mut self, key: &KeySpec) -> Result<()> {
        self.record(format!("press {}", key))
    }

    fn key_up(&mut self, key: &KeySpec) -> Result<()> {
        self.record(format!("release {}", key))
    }

    fn position(&mut self) -> Result<Coordinate> {
        Ok(*self.inner.pointer.lock())
    }
}

impl Clock for Recorder {
    fn now(&self) -> Instant {
        self.inner.base + *self.inner.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.inner.elapsed.lock() += duration;
        let _ = self.record(format!("sleep {}", duration.as_secs_f64()));
    }
}
