//! Synthetic mouse and keyboard input.
//!
//! The engine talks to the desktop only through [`InputEffector`], so tests
//! can swap in a recorder. [`EnigoEffector`] is the real implementation.

use std::time::Duration;

use device_query::{DeviceQuery, DeviceState};
use enigo::{Button, Coordinate as EnigoCoordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::error::{MacroError, Result};
use crate::keys::{KeySpec, SpecialKey};
use crate::plan::Coordinate;

/// Interpolation rate for moves that take time.
const MOVE_STEPS_PER_SECOND: f64 = 60.0;

pub trait InputEffector {
    /// Move the pointer to `target`, taking `duration` to get there.
    fn move_to(&mut self, target: Coordinate, duration: Duration) -> Result<()>;

    /// Left click at the current pointer position.
    fn click(&mut self) -> Result<()>;

    fn key_down(&mut self, key: &KeySpec) -> Result<()>;

    fn key_up(&mut self, key: &KeySpec) -> Result<()>;

    /// Press and release `key`.
    fn tap(&mut self, key: &KeySpec) -> Result<()> {
        self.key_down(key)?;
        self.key_up(key)
    }

    /// Current pointer position.
    fn position(&mut self) -> Result<Coordinate>;
}

/// Desktop input through `enigo`; the pointer position is read with
/// `device_query`.
pub struct EnigoEffector {
    enigo: Enigo,
    device: DeviceState,
}

impl EnigoEffector {
    pub fn new() -> Result<Self> {
        let enigo = Enigo::new(&Settings::default())?;
        Ok(EnigoEffector {
            enigo,
            device: DeviceState::new(),
        })
    }

    fn key(&mut self, key: &KeySpec, direction: Direction) -> Result<()> {
        let mapped = map_key(key);
        // Some backends panic on unmappable keys instead of returning an error.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.enigo.key(mapped, direction)
        }));
        match result {
            Ok(res) => res.map_err(MacroError::from),
            Err(_) => Err(MacroError::Input(format!("Keyboard simulation panicked on {}", key))),
        }
    }
}

impl InputEffector for EnigoEffector {
    fn move_to(&mut self, target: Coordinate, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            self.enigo.move_mouse(target.x, target.y, EnigoCoordinate::Abs)?;
            return Ok(());
        }

        let start = self.position()?;
        let secs = duration.as_secs_f64();
        let steps = (secs * MOVE_STEPS_PER_SECOND).max(1.0) as i32;
        let pause = duration / steps as u32;
        for i in 1..=steps {
            let t = i as f64 / steps as f64;
            let x = start.x as f64 + (target.x - start.x) as f64 * t;
            let y = start.y as f64 + (target.y - start.y) as f64 * t;
            self.enigo
                .move_mouse(x.round() as i32, y.round() as i32, EnigoCoordinate::Abs)?;
            std::thread::sleep(pause);
        }
        Ok(())
    }

    fn click(&mut self) -> Result<()> {
        self.enigo.button(Button::Left, Direction::Click)?;
        Ok(())
    }

    fn key_down(&mut self, key: &KeySpec) -> Result<()> {
        self.key(key, Direction::Press)
    }

    fn key_up(&mut self, key: &KeySpec) -> Result<()> {
        self.key(key, Direction::Release)
    }

    fn position(&mut self) -> Result<Coordinate> {
        let mouse = self.device.get_mouse();
        Ok(Coordinate::new(mouse.coords.0, mouse.coords.1))
    }
}

fn map_key(key: &KeySpec) -> Key {
    match key {
        KeySpec::Char(c) => Key::Unicode(*c),
        KeySpec::Special(special) => match special {
            SpecialKey::Space => Key::Space,
            SpecialKey::Esc => Key::Escape,
            SpecialKey::Enter => Key::Return,
            SpecialKey::Shift => Key::Shift,
            SpecialKey::Ctrl => Key::Control,
            SpecialKey::Alt => Key::Alt,
            SpecialKey::Tab => Key::Tab,
            SpecialKey::Backspace => Key::Backspace,
            SpecialKey::Delete => Key::Delete,
            SpecialKey::Up => Key::UpArrow,
            SpecialKey::Down => Key::DownArrow,
            SpecialKey::Left => Key::LeftArrow,
            SpecialKey::Right => Key::RightArrow,
            SpecialKey::Home => Key::Home,
            SpecialKey::End => Key::End,
            SpecialKey::PageUp => Key::PageUp,
            SpecialKey::PageDown => Key::PageDown,
            SpecialKey::CapsLock => Key::CapsLock,
            SpecialKey::F(n) => function_key(*n),
        },
    }
}

fn function_key(n: u8) -> Key {
    match n {
        1 => Key::F1,
        2 => Key::F2,
        3 => Key::F3,
        4 => Key::F4,
        5 => Key::F5,
        6 => Key::F6,
        7 => Key::F7,
        8 => Key::F8,
        9 => Key::F9,
        10 => Key::F10,
        11 => Key::F11,
        _ => Key::F12,
    }
}
