//! Named screen positions and live pointer capture.
//!
//! Positions live in the `positions` section of the configuration document.
//! A capture waits on a helper thread for the next pointer-button press and
//! snapshots the pointer coordinate at that moment.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, bounded};
use device_query::{DeviceQuery, DeviceState};

use crate::config::ConfigStore;
use crate::error::{MacroError, Result};
use crate::plan::Coordinate;

const CAPTURE_POLL: Duration = Duration::from_millis(10);

/// Something that can report the pointer location and button state.
pub trait PointerSource: Send + 'static {
    fn position(&self) -> Coordinate;

    fn any_button_down(&self) -> bool;
}

/// Pointer state read through `device_query`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceQuerySource;

impl PointerSource for DeviceQuerySource {
    fn position(&self) -> Coordinate {
        let mouse = DeviceState::new().get_mouse();
        Coordinate::new(mouse.coords.0, mouse.coords.1)
    }

    fn any_button_down(&self) -> bool {
        // Index 0 is unused by device_query; buttons start at 1.
        DeviceState::new()
            .get_mouse()
            .button_pressed
            .iter()
            .skip(1)
            .any(|pressed| *pressed)
    }
}

/// Wait on a helper thread for the next button press (a released → pressed
/// edge) and deliver the pointer coordinate. The channel disconnects
/// without a value if `timeout` elapses first.
pub fn capture_position<S: PointerSource>(source: S, timeout: Option<Duration>) -> Result<Receiver<Coordinate>> {
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("position_capture".into())
        .spawn(move || {
            let started = Instant::now();
            let mut was_down = source.any_button_down();
            loop {
                if timeout.is_some_and(|t| started.elapsed() > t) {
                    tracing::warn!("Position capture timed out");
                    return;
                }
                let down = source.any_button_down();
                if down && !was_down {
                    let coord = source.position();
                    let _ = tx.send(coord);
                    return;
                }
                was_down = down;
                thread::sleep(CAPTURE_POLL);
            }
        })?;
    Ok(rx)
}

/// Name → coordinate map backed by the configuration store.
#[derive(Clone)]
pub struct PositionStore {
    store: Arc<ConfigStore>,
}

impl PositionStore {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        PositionStore { store }
    }

    pub fn get(&self, name: &str) -> Option<Coordinate> {
        self.store.snapshot().positions.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.store.snapshot().positions.keys().cloned().collect()
    }

    /// Store a coordinate and save immediately.
    pub fn set(&self, name: &str, coord: Coordinate) -> Result<()> {
        if name.trim().is_empty() {
            return Err(MacroError::Validation("Position name must not be empty".into()));
        }
        self.store.update(|config| {
            config.positions.insert(name.to_string(), coord);
        });
        self.store.flush()?;
        tracing::info!("Saved position {} = {}", name, coord);
        Ok(())
    }

    /// Capture the next click as `name`, blocking until it arrives.
    pub fn capture<S: PointerSource>(&self, name: &str, source: S, timeout: Option<Duration>) -> Result<Coordinate> {
        let rx = capture_position(source, timeout)?;
        let coord = rx
            .recv()
            .map_err(|_| MacroError::Capture(format!("No click captured for {:?}", name)))?;
        self.set(name, coord)?;
        Ok(coord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports the button as pressed from the third poll on, already held at
    /// the first poll when `held_at_start` is set.
    struct ScriptedPointer {
        polls: Arc<AtomicUsize>,
        held_at_start: bool,
    }

    impl PointerSource for ScriptedPointer {
        fn position(&self) -> Coordinate {
            Coordinate::new(640, 480)
        }

        fn any_button_down(&self) -> bool {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => self.held_at_start,
                1 => false,
                _ => true,
            }
        }
    }

    #[test]
    fn capture_waits_for_a_fresh_press() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::with_config(dir.path().join("config.json"), Config::default()));
        let positions = PositionStore::new(Arc::clone(&store));
        let polls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedPointer {
            polls: Arc::clone(&polls),
            held_at_start: true,
        };

        let coord = positions.capture("altar", source, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(coord, Coordinate::new(640, 480));
        assert!(polls.load(Ordering::SeqCst) >= 3);
        assert_eq!(positions.get("altar"), Some(coord));
        // Explicit saves go straight to disk.
        assert!(!store.is_dirty());
        assert!(store.path().exists());
    }

    #[test]
    fn capture_times_out() {
        struct NeverClicks;
        impl PointerSource for NeverClicks {
            fn position(&self) -> Coordinate {
                Coordinate::default()
            }
            fn any_button_down(&self) -> bool {
                false
            }
        }

        let rx = capture_position(NeverClicks, Some(Duration::from_millis(30))).unwrap();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn empty_names_are_rejected() {
        let store = Arc::new(ConfigStore::with_config("unused.json", Config::default()));
        let positions = PositionStore::new(store);
        assert!(positions.set(" ", Coordinate::new(1, 2)).is_err());
    }
}
