//! Key names used by bindings, panel keys and hotkey chords.
//!
//! A binding is either a single character or one of a fixed set of named
//! special keys. Names are case-insensitive and accept the usual aliases.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{MacroError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpecialKey {
    Space,
    Esc,
    Enter,
    Shift,
    Ctrl,
    Alt,
    Tab,
    Backspace,
    Delete,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    F(u8),
    CapsLock,
}

impl SpecialKey {
    /// Canonical lower-case name, as written in the configuration file.
    pub fn name(&self) -> String {
        match self {
            SpecialKey::Space => "space".into(),
            SpecialKey::Esc => "esc".into(),
            SpecialKey::Enter => "enter".into(),
            SpecialKey::Shift => "shift".into(),
            SpecialKey::Ctrl => "ctrl".into(),
            SpecialKey::Alt => "alt".into(),
            SpecialKey::Tab => "tab".into(),
            SpecialKey::Backspace => "backspace".into(),
            SpecialKey::Delete => "delete".into(),
            SpecialKey::Up => "up".into(),
            SpecialKey::Down => "down".into(),
            SpecialKey::Left => "left".into(),
            SpecialKey::Right => "right".into(),
            SpecialKey::Home => "home".into(),
            SpecialKey::End => "end".into(),
            SpecialKey::PageUp => "page_up".into(),
            SpecialKey::PageDown => "page_down".into(),
            SpecialKey::F(n) => format!("f{}", n),
            SpecialKey::CapsLock => "caps_lock".into(),
        }
    }

    fn parse(s: &str) -> Option<SpecialKey> {
        let key = match s {
            "space" => SpecialKey::Space,
            "esc" | "escape" => SpecialKey::Esc,
            "enter" | "return" => SpecialKey::Enter,
            "shift" => SpecialKey::Shift,
            "ctrl" | "control" => SpecialKey::Ctrl,
            "alt" | "option" => SpecialKey::Alt,
            "tab" => SpecialKey::Tab,
            "backspace" => SpecialKey::Backspace,
            "delete" | "del" => SpecialKey::Delete,
            "up" | "arrow_up" | "uparrow" => SpecialKey::Up,
            "down" | "arrow_down" | "downarrow" => SpecialKey::Down,
            "left" | "arrow_left" | "leftarrow" => SpecialKey::Left,
            "right" | "arrow_right" | "rightarrow" => SpecialKey::Right,
            "home" => SpecialKey::Home,
            "end" => SpecialKey::End,
            "page_up" | "pageup" | "pgup" => SpecialKey::PageUp,
            "page_down" | "pagedown" | "pgdn" => SpecialKey::PageDown,
            "caps_lock" | "capslock" => SpecialKey::CapsLock,
            _ => return function_key(s),
        };
        Some(key)
    }
}

fn function_key(s: &str) -> Option<SpecialKey> {
    let n: u8 = s.strip_prefix('f')?.parse().ok()?;
    (1..=12).contains(&n).then_some(SpecialKey::F(n))
}

/// A single bindable key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySpec {
    Char(char),
    Special(SpecialKey),
}

impl KeySpec {
    /// Canonical name used in chords and traces.
    pub fn name(&self) -> String {
        match self {
            KeySpec::Char(c) => c.to_string(),
            KeySpec::Special(k) => k.name(),
        }
    }
}

impl FromStr for KeySpec {
    type Err = MacroError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Ok(KeySpec::Char(c.to_ascii_lowercase()));
        }

        let lower = trimmed.to_lowercase().replace([' ', '-'], "_");
        SpecialKey::parse(&lower)
            .map(KeySpec::Special)
            .ok_or_else(|| MacroError::Key(format!("Unknown key: {:?}", s)))
    }
}

impl TryFrom<String> for KeySpec {
    type Error = MacroError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<KeySpec> for String {
    fn from(k: KeySpec) -> Self {
        k.name()
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

bitflags! {
    /// Modifier keys held around a click.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b001;
        const CTRL = 0b010;
        const ALT = 0b100;
    }
}

impl Modifiers {
    /// Modifier keys in press order: Shift, Ctrl, Alt.
    pub fn press_order(&self) -> Vec<KeySpec> {
        let mut keys = Vec::new();
        if self.contains(Modifiers::SHIFT) {
            keys.push(KeySpec::Special(SpecialKey::Shift));
        }
        if self.contains(Modifiers::CTRL) {
            keys.push(KeySpec::Special(SpecialKey::Ctrl));
        }
        if self.contains(Modifiers::ALT) {
            keys.push(KeySpec::Special(SpecialKey::Alt));
        }
        keys
    }

    fn parse_one(s: &str) -> Result<Modifiers> {
        match s.trim().to_lowercase().as_str() {
            "shift" => Ok(Modifiers::SHIFT),
            "ctrl" | "control" => Ok(Modifiers::CTRL),
            "alt" | "option" => Ok(Modifiers::ALT),
            other => Err(MacroError::Key(format!("Unknown modifier: {}", other))),
        }
    }

    fn names(&self) -> Vec<String> {
        self.press_order().iter().map(|k| capitalize(&k.name())).collect()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// Persisted as a list of names, e.g. ["Shift", "Ctrl"].
impl Serialize for Modifiers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Modifiers {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Modifiers::empty(), |acc, name| {
            Modifiers::parse_one(name)
                .map(|m| acc | m)
                .map_err(serde::de::Error::custom)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_characters_and_special_keys() {
        assert_eq!("Q".parse::<KeySpec>().unwrap(), KeySpec::Char('q'));
        assert_eq!(
            "Escape".parse::<KeySpec>().unwrap(),
            KeySpec::Special(SpecialKey::Esc)
        );
        assert_eq!(
            "page up".parse::<KeySpec>().unwrap(),
            KeySpec::Special(SpecialKey::PageUp)
        );
        assert_eq!(
            "F12".parse::<KeySpec>().unwrap(),
            KeySpec::Special(SpecialKey::F(12))
        );
        assert!("f13".parse::<KeySpec>().is_err());
        assert!("hyper".parse::<KeySpec>().is_err());
    }

    #[test]
    fn names_round_trip() {
        for name in ["space", "caps_lock", "page_down", "f1", "x", "7"] {
            let key: KeySpec = name.parse().unwrap();
            assert_eq!(key.name(), name);
        }
    }

    #[test]
    fn modifiers_press_in_stable_order() {
        let mods = Modifiers::ALT | Modifiers::SHIFT;
        let names: Vec<String> = mods.press_order().iter().map(KeySpec::name).collect();
        assert_eq!(names, vec!["shift", "alt"]);
    }

    #[test]
    fn modifiers_serialize_as_names() {
        let mods = Modifiers::CTRL | Modifiers::SHIFT;
        let json = serde_json::to_string(&mods).unwrap();
        assert_eq!(json, r#"["Shift","Ctrl"]"#);
        let back: Modifiers = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mods);
        assert!(serde_json::from_str::<Modifiers>(r#"["Meta"]"#).is_err());
    }
}
