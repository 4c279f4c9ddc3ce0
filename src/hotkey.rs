//! Global hotkey chords and their dispatch
//!
//! A chord is an unordered set of keys held together. Chords fire once when
//! the last of their keys goes down and re-arm only after one of them is
//! released, so auto-repeat and partial releases never retrigger.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rdev::{EventType, Key, listen};

use crate::engine::EngineCommand;
use crate::error::{MacroError, Result};
use crate::keys::KeySpec;
use crate::plan::MacroDef;

/// Unordered set of canonical key names, written `"alt+x"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chord(BTreeSet<String>);

impl Chord {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    fn is_held(&self, held: &HashSet<String>) -> bool {
        self.0.iter().all(|k| held.contains(k))
    }
}

impl FromStr for Chord {
    type Err = MacroError;

    fn from_str(s: &str) -> Result<Self> {
        let mut keys = BTreeSet::new();
        for part in s.split('+') {
            let part = part.trim();
            if part.is_empty() {
                return Err(MacroError::Hotkey(format!("Empty key in chord {:?}", s)));
            }
            let key = match part.to_lowercase().as_str() {
                "meta" | "cmd" | "super" | "win" => "meta".to_string(),
                _ => part.parse::<KeySpec>()?.name(),
            };
            keys.insert(key);
        }
        Ok(Chord(keys))
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.keys().collect();
        f.write_str(&keys.join("+"))
    }
}

/// What a chord does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotkeyAction {
    Command(EngineCommand),
    Macro(String),
}

pub type Bindings = HashMap<Chord, HotkeyAction>;

/// Fixed engine chords: Alt+X start, Alt+C pause/resume, F1 stop.
pub fn engine_bindings() -> Bindings {
    let mut bindings = Bindings::new();
    for (chord, command) in [
        ("alt+x", EngineCommand::Start),
        ("alt+c", EngineCommand::TogglePause),
        ("f1", EngineCommand::Stop),
    ] {
        if let Ok(chord) = chord.parse() {
            bindings.insert(chord, HotkeyAction::Command(command));
        }
    }
    bindings
}

/// Engine chords plus every macro that has a valid hotkey. Macro chords that
/// collide with an existing binding are skipped with a warning.
pub fn bindings_for(macros: &[MacroDef]) -> Bindings {
    let mut bindings = engine_bindings();
    for def in macros {
        match def.chord() {
            Ok(Some(chord)) => {
                if let Some(existing) = bindings.get(&chord) {
                    tracing::warn!(
                        "Hotkey {} of macro {:?} is already bound to {:?}",
                        chord,
                        def.name,
                        existing
                    );
                    continue;
                }
                bindings.insert(chord, HotkeyAction::Macro(def.name.clone()));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring hotkey of macro {:?}: {}", def.name, e),
        }
    }
    bindings
}

/// Edge-triggered, order-insensitive chord detection.
#[derive(Debug, Default)]
pub struct ChordMatcher {
    held: HashSet<String>,
    latched: HashSet<Chord>,
}

impl ChordMatcher {
    /// Record a key press and return the chords that fire because of it.
    pub fn press(&mut self, key: &str, bindings: &Bindings) -> Vec<Chord> {
        self.held.insert(key.to_string());
        let mut fired = Vec::new();
        for chord in bindings.keys() {
            if chord.is_held(&self.held) && !self.latched.contains(chord) {
                self.latched.insert(chord.clone());
                fired.push(chord.clone());
            }
        }
        fired.sort();
        fired
    }

    pub fn release(&mut self, key: &str) {
        self.held.remove(key);
        let held = &self.held;
        self.latched.retain(|chord| chord.is_held(held));
    }

    fn retain_bindings(&mut self, bindings: &Bindings) {
        self.latched.retain(|chord| bindings.contains_key(chord));
    }
}

/// Where dispatched hotkeys go. Implemented by the engine.
pub trait HotkeyTarget: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    fn run_command(&self, command: EngineCommand);

    fn start_macro(&self, name: &str);
}

struct DispatchState {
    bindings: Bindings,
    matcher: ChordMatcher,
}

/// Turns global key events into chord activations.
pub struct HotkeyDispatcher {
    target: Arc<dyn HotkeyTarget>,
    state: Mutex<DispatchState>,
}

impl HotkeyDispatcher {
    pub fn new(target: Arc<dyn HotkeyTarget>) -> Arc<Self> {
        Arc::new(HotkeyDispatcher {
            target,
            state: Mutex::new(DispatchState {
                bindings: Bindings::new(),
                matcher: ChordMatcher::default(),
            }),
        })
    }

    /// Replace the whole binding table.
    pub fn register(&self, bindings: Bindings) {
        let mut state = self.state.lock();
        state.matcher.retain_bindings(&bindings);
        tracing::info!("Registered {} hotkeys", bindings.len());
        state.bindings = bindings;
    }

    pub fn key_pressed(&self, key: &str) {
        let actions: Vec<HotkeyAction> = {
            let mut state = self.state.lock();
            let DispatchState { bindings, matcher } = &mut *state;
            matcher
                .press(key, bindings)
                .iter()
                .filter_map(|chord| bindings.get(chord).cloned())
                .collect()
        };
        for action in actions {
            self.dispatch(action);
        }
    }

    pub fn key_released(&self, key: &str) {
        self.state.lock().matcher.release(key);
    }

    fn dispatch(&self, action: HotkeyAction) {
        match action {
            HotkeyAction::Command(command) => {
                tracing::debug!("Hotkey command {:?}", command);
                let target = Arc::clone(&self.target);
                let spawned = thread::Builder::new()
                    .name("hotkey_command".into())
                    .spawn(move || target.run_command(command));
                if let Err(e) = spawned {
                    tracing::error!("Failed to spawn hotkey command thread: {}", e);
                }
            }
            HotkeyAction::Macro(name) => {
                if self.target.is_enabled() {
                    self.target.start_macro(&name);
                } else {
                    tracing::info!("Ignoring hotkey for {:?}: engine is disabled", name);
                }
            }
        }
    }

    /// Start the global listener thread. If the OS hook fails the error is
    /// logged and only the listener stops.
    pub fn spawn_listener(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        let dispatcher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("hotkey_listener".into())
            .spawn(move || {
                let callback = move |event: rdev::Event| match event.event_type {
                    EventType::KeyPress(key) => {
                        if let Some(name) = key_name(&key) {
                            dispatcher.key_pressed(&name);
                        }
                    }
                    EventType::KeyRelease(key) => {
                        if let Some(name) = key_name(&key) {
                            dispatcher.key_released(&name);
                        }
                    }
                    _ => {}
                };

                if let Err(e) = listen(callback) {
                    let e = MacroError::from(e);
                    tracing::error!("Hotkey listener stopped: {}", e);
                }
            })?;
        Ok(handle)
    }
}

/// Canonical chord name for an OS key, `None` for keys chords never use.
fn key_name(key: &Key) -> Option<String> {
    let name = match key {
        Key::ShiftLeft | Key::ShiftRight => "shift",
        Key::ControlLeft | Key::ControlRight => "ctrl",
        Key::Alt | Key::AltGr => "alt",
        Key::MetaLeft | Key::MetaRight => "meta",
        Key::Space => "space",
        Key::Escape => "esc",
        Key::Return | Key::KpReturn => "enter",
        Key::Tab => "tab",
        Key::Backspace => "backspace",
        Key::Delete | Key::KpDelete => "delete",
        Key::UpArrow => "up",
        Key::DownArrow => "down",
        Key::LeftArrow => "left",
        Key::RightArrow => "right",
        Key::Home => "home",
        Key::End => "end",
        Key::PageUp => "page_up",
        Key::PageDown => "page_down",
        Key::CapsLock => "caps_lock",
        Key::F1 => "f1",
        Key::F2 => "f2",
        Key::F3 => "f3",
        Key::F4 => "f4",
        Key::F5 => "f5",
        Key::F6 => "f6",
        Key::F7 => "f7",
        Key::F8 => "f8",
        Key::F9 => "f9",
        Key::F10 => "f10",
        Key::F11 => "f11",
        Key::F12 => "f12",
        Key::Minus => "-",
        Key::Equal => "=",
        Key::Comma => ",",
        Key::Dot => ".",
        Key::Slash => "/",
        Key::SemiColon => ";",
        Key::Quote => "'",
        Key::BackQuote => "`",
        Key::LeftBracket => "[",
        Key::RightBracket => "]",
        Key::BackSlash => "\\",
        _ => return letter_or_digit(key).map(|c| c.to_string()),
    };
    Some(name.to_string())
}

fn letter_or_digit(key: &Key) -> Option<char> {
    let c = match key {
        Key::KeyA => 'a',
        Key::KeyB => 'b',
        Key::KeyC => 'c',
        Key::KeyD => 'd',
        Key::KeyE => 'e',
        Key::KeyF => 'f',
        Key::KeyG => 'g',
        Key::KeyH => 'h',
        Key::KeyI => 'i',
        Key::KeyJ => 'j',
        Key::KeyK => 'k',
        Key::KeyL => 'l',
        Key::KeyM => 'm',
        Key::KeyN => 'n',
        Key::KeyO => 'o',
        Key::KeyP => 'p',
        Key::KeyQ => 'q',
        Key::KeyR => 'r',
        Key::KeyS => 's',
        Key::KeyT => 't',
        Key::KeyU => 'u',
        Key::KeyV => 'v',
        Key::KeyW => 'w',
        Key::KeyX => 'x',
        Key::KeyY => 'y',
        Key::KeyZ => 'z',
        Key::Num0 | Key::Kp0 => '0',
        Key::Num1 | Key::Kp1 => '1',
        Key::Num2 | Key::Kp2 => '2',
        Key::Num3 | Key::Kp3 => '3',
        Key::Num4 | Key::Kp4 => '4',
        Key::Num5 | Key::Kp5 => '5',
        Key::Num6 | Key::Kp6 => '6',
        Key::Num7 | Key::Kp7 => '7',
        Key::Num8 | Key::Kp8 => '8',
        Key::Num9 | Key::Kp9 => '9',
        _ => return None,
    };
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{Sender, unbounded};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn chord(s: &str) -> Chord {
        s.parse().unwrap()
    }

    fn single(chord_text: &str) -> Bindings {
        Bindings::from([(chord(chord_text), HotkeyAction::Macro("m".into()))])
    }

    #[test]
    fn chords_are_case_and_order_insensitive() {
        assert_eq!(chord("Alt+X"), chord("x+ALT"));
        assert_eq!(chord("Control+Shift+Escape"), chord("shift+esc+ctrl"));
        assert_eq!(chord("ctrl+shift+a").to_string(), "a+ctrl+shift");
        assert!("alt+".parse::<Chord>().is_err());
        assert!("alt+bogus".parse::<Chord>().is_err());
    }

    #[test]
    fn fires_once_while_held() {
        let bindings = single("ctrl+shift+a");
        let mut m = ChordMatcher::default();
        assert!(m.press("shift", &bindings).is_empty());
        assert!(m.press("a", &bindings).is_empty());
        assert_eq!(m.press("ctrl", &bindings), vec![chord("ctrl+shift+a")]);
        // Auto-repeat.
        for _ in 0..10 {
            assert!(m.press("a", &bindings).is_empty());
        }
        // Partial release then re-press re-arms the chord.
        m.release("shift");
        assert_eq!(m.press("shift", &bindings).len(), 1);
    }

    #[test]
    fn default_bindings_include_engine_chords() {
        let mut def = MacroDef::new("Drink", vec![]);
        def.hotkey = Some("Alt+D".into());
        let mut clash = MacroDef::new("Clash", vec![]);
        clash.hotkey = Some("F1".into());
        let bindings = bindings_for(&[def, clash]);

        assert_eq!(bindings[&chord("alt+x")], HotkeyAction::Command(EngineCommand::Start));
        assert_eq!(bindings[&chord("alt+c")], HotkeyAction::Command(EngineCommand::TogglePause));
        assert_eq!(bindings[&chord("f1")], HotkeyAction::Command(EngineCommand::Stop));
        assert_eq!(bindings[&chord("d+alt")], HotkeyAction::Macro("Drink".into()));
        assert_eq!(bindings.len(), 4);
    }

    struct Target {
        enabled: AtomicBool,
        events: Sender<String>,
    }

    impl HotkeyTarget for Target {
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn run_command(&self, command: EngineCommand) {
            let _ = self.events.send(format!("{:?}", command));
        }

        fn start_macro(&self, name: &str) {
            let _ = self.events.send(format!("macro {}", name));
        }
    }

    #[test]
    fn dispatch_respects_master_enable() {
        let (tx, rx) = unbounded();
        let target = Arc::new(Target {
            enabled: AtomicBool::new(false),
            events: tx,
        });
        let dispatcher = HotkeyDispatcher::new(target.clone());
        let mut def = MacroDef::new("Drink", vec![]);
        def.hotkey = Some("alt+d".into());
        dispatcher.register(bindings_for(&[def]));

        dispatcher.key_pressed("alt");
        dispatcher.key_pressed("d");
        dispatcher.key_released("d");
        assert!(rx.try_recv().is_err());

        // Engine commands go through even when disabled.
        dispatcher.key_pressed("x");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "Start");
        dispatcher.key_released("x");

        target.enabled.store(true, Ordering::SeqCst);
        dispatcher.key_pressed("d");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "macro Drink");
    }

    #[test]
    fn register_replaces_bindings() {
        let (tx, rx) = unbounded();
        let dispatcher = HotkeyDispatcher::new(Arc::new(Target {
            enabled: AtomicBool::new(true),
            events: tx,
        }));
        dispatcher.register(single("f5"));
        dispatcher.register(Bindings::from([(chord("f6"), HotkeyAction::Macro("other".into()))]));
        dispatcher.key_pressed("f5");
        dispatcher.key_pressed("f6");
        assert_eq!(rx.try_recv().unwrap(), "macro other");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn maps_os_keys() {
        assert_eq!(key_name(&Key::ShiftRight).as_deref(), Some("shift"));
        assert_eq!(key_name(&Key::KeyQ).as_deref(), Some("q"));
        assert_eq!(key_name(&Key::F12).as_deref(), Some("f12"));
        assert_eq!(key_name(&Key::Unknown(999)), None);
    }

    const KEYS: [&str; 6] = ["ctrl", "shift", "alt", "a", "b", "f2"];

    proptest! {
        #[test]
        fn held_chord_dispatches_once_per_hold(
            order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
            repeats in proptest::collection::vec(0usize..4, 0..30),
            released in 0usize..4,
        ) {
            let keys: Vec<&str> = order.iter().map(|i| KEYS[*i]).collect();
            let text = keys.join("+");
            let bindings = single(&text);
            let mut m = ChordMatcher::default();

            let mut fired = 0;
            for key in &keys {
                fired += m.press(key, &bindings).len();
            }
            for r in &repeats {
                fired += m.press(keys[*r], &bindings).len();
            }
            prop_assert_eq!(fired, 1);

            m.release(keys[released]);
            fired += m.press(keys[released], &bindings).len();
            prop_assert_eq!(fired, 2);
        }
    }
}
