//! Macro data model: coordinates, actions and macro definitions.
//!
//! A macro is a named, ordered list of steps plus execution modifiers
//! (looping, scheduling and dose cycling). Definitions are plain data; the
//! engine wraps them in runtime records when they are loaded.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MacroError, Result};
use crate::hotkey::Chord;
use crate::interval::Interval;
use crate::keys::{KeySpec, Modifiers};

/// Screen coordinate in pixels, persisted as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    pub fn new(x: i32, y: i32) -> Self {
        Coordinate { x, y }
    }
}

impl From<[i32; 2]> for Coordinate {
    fn from([x, y]: [i32; 2]) -> Self {
        Coordinate { x, y }
    }
}

impl From<Coordinate> for [i32; 2] {
    fn from(c: Coordinate) -> Self {
        [c.x, c.y]
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Parses `"x,y"`, tolerating whitespace and surrounding parentheses.
impl FromStr for Coordinate {
    type Err = MacroError;

    fn from_str(s: &str) -> Result<Self> {
        let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
        let (x, y) = inner
            .split_once(',')
            .ok_or_else(|| MacroError::Validation(format!("Coordinate {:?} is not \"x,y\"", s)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<i32>()
                .map_err(|_| MacroError::Validation(format!("Bad coordinate value {:?} in {:?}", v.trim(), s)))
        };
        Ok(Coordinate::new(parse(x)?, parse(y)?))
    }
}

/// Panels reachable through a dedicated key binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Panel {
    Inventory,
    Prayer,
    Spells,
    Custom,
}

/// Where a click lands: one coordinate or an ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClickTargets {
    Single(Coordinate),
    List(Vec<Coordinate>),
}

impl ClickTargets {
    pub fn as_slice(&self) -> &[Coordinate] {
        match self {
            ClickTargets::Single(c) => std::slice::from_ref(c),
            ClickTargets::List(list) => list,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Default for ClickTargets {
    fn default() -> Self {
        ClickTargets::List(Vec::new())
    }
}

/// Seconds, or the name of an entry in the wait table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitDuration {
    Seconds(f64),
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    PressPanelKey {
        key: KeySpec,
    },
    PressSpecificPanelKey {
        panel: Panel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_key: Option<KeySpec>,
    },
    Click {
        #[serde(default)]
        use_saved_target: bool,
        #[serde(default)]
        positions: ClickTargets,
        #[serde(default)]
        modifiers: Modifiers,
    },
    ReturnMouse {
        #[serde(default)]
        click_after_return: bool,
    },
    Wait {
        duration: WaitDuration,
    },
    RunMacro {
        macro_name: String,
    },
}

impl Action {
    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::PressPanelKey { .. } => "press_panel_key",
            Action::PressSpecificPanelKey { .. } => "press_specific_panel_key",
            Action::Click { .. } => "click",
            Action::ReturnMouse { .. } => "return_mouse",
            Action::Wait { .. } => "wait",
            Action::RunMacro { .. } => "run_macro",
        }
    }
}

/// One entry of a macro's plan. The annotation is only used in logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl From<Action> for Step {
    fn from(action: Action) -> Self {
        Step {
            action,
            annotation: None,
        }
    }
}

/// Loop count meaning "repeat until stopped".
pub const UNBOUNDED: i64 = -1;

fn default_loop_count() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotkey: Option<String>,
    #[serde(default)]
    pub actions: Vec<Step>,

    #[serde(default)]
    pub is_dose_macro: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_count: Option<u32>,

    #[serde(default)]
    pub is_loop_macro: bool,
    #[serde(default = "default_loop_count")]
    pub loop_count: i64,

    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_interval: Option<String>,

    /// Dose state persists across runs.
    #[serde(default)]
    pub call_count: u64,
    #[serde(default)]
    pub current_position_index: usize,
}

impl MacroDef {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        MacroDef {
            name: name.into(),
            hotkey: None,
            actions: actions.into_iter().map(Step::from).collect(),
            is_dose_macro: false,
            dose_count: None,
            is_loop_macro: false,
            loop_count: default_loop_count(),
            is_scheduled: false,
            schedule_interval: None,
            call_count: 0,
            current_position_index: 0,
        }
    }

    /// Largest positions-list length across click actions; 0 without clicks.
    pub fn max_positions_len(&self) -> usize {
        self.actions
            .iter()
            .filter_map(|step| match &step.action {
                Action::Click { positions, .. } => Some(positions.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Dose count if this macro cycles positions, otherwise `None`.
    pub fn dose(&self) -> Option<u32> {
        if self.is_dose_macro { self.dose_count } else { None }
    }

    /// Number of iterations to run, `None` when unbounded.
    pub fn iterations(&self) -> Option<u64> {
        if !self.is_loop_macro {
            Some(1)
        } else if self.loop_count == UNBOUNDED {
            None
        } else {
            Some(self.loop_count.max(0) as u64)
        }
    }

    pub fn interval(&self) -> Result<Interval> {
        let text = self.schedule_interval.as_deref().ok_or_else(|| {
            MacroError::Validation(format!("Macro {:?} is scheduled without an interval", self.name))
        })?;
        text.parse()
    }

    pub fn chord(&self) -> Result<Option<Chord>> {
        match self.hotkey.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => text.parse().map(Some),
        }
    }

    /// Check this definition on its own.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MacroError::Validation("Macro name must not be empty".into()));
        }
        if self.is_dose_macro && !matches!(self.dose_count, Some(n) if n > 0) {
            return Err(MacroError::Validation(format!(
                "Macro {:?}: dose count must be a positive integer",
                self.name
            )));
        }
        if self.is_loop_macro && self.loop_count != UNBOUNDED && self.loop_count <= 0 {
            return Err(MacroError::Validation(format!(
                "Macro {:?}: loop count must be a positive integer or -1",
                self.name
            )));
        }
        if self.is_scheduled {
            self.interval()?;
        }
        self.chord()?;

        for step in &self.actions {
            match &step.action {
                Action::Click {
                    use_saved_target: false,
                    positions,
                    ..
                } if positions.is_empty() => {
                    return Err(MacroError::Validation(format!(
                        "Macro {:?}: click without positions",
                        self.name
                    )));
                }
                Action::PressSpecificPanelKey {
                    panel: Panel::Custom,
                    custom_key: None,
                } => {
                    return Err(MacroError::Validation(format!(
                        "Macro {:?}: custom panel key is missing",
                        self.name
                    )));
                }
                Action::Wait {
                    duration: WaitDuration::Seconds(secs),
                } if !secs.is_finite() || *secs < 0.0 => {
                    return Err(MacroError::Validation(format!(
                        "Macro {:?}: wait of {} seconds",
                        self.name, secs
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Validate a whole catalog, including name uniqueness.
pub fn validate_catalog(macros: &[MacroDef]) -> Result<()> {
    let mut seen = HashSet::new();
    for def in macros {
        def.validate()?;
        if !seen.insert(def.name.as_str()) {
            return Err(MacroError::Validation(format!("Duplicate macro name {:?}", def.name)));
        }
    }
    Ok(())
}

/// Validate `candidate` before it replaces the macro called `replacing`
/// (or is appended when `replacing` is `None`).
pub fn validate_candidate(catalog: &[MacroDef], candidate: &MacroDef, replacing: Option<&str>) -> Result<()> {
    candidate.validate()?;
    let clash = catalog
        .iter()
        .filter(|def| Some(def.name.as_str()) != replacing)
        .any(|def| def.name == candidate.name);
    if clash {
        return Err(MacroError::Validation(format!(
            "A macro named {:?} already exists",
            candidate.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(positions: Vec<(i32, i32)>) -> Action {
        Action::Click {
            use_saved_target: false,
            positions: ClickTargets::List(positions.into_iter().map(|(x, y)| Coordinate::new(x, y)).collect()),
            modifiers: Modifiers::empty(),
        }
    }

    #[test]
    fn coordinate_parses_loosely() {
        assert_eq!(" 10, 20 ".parse::<Coordinate>().unwrap(), Coordinate::new(10, 20));
        assert_eq!("(-5,7)".parse::<Coordinate>().unwrap(), Coordinate::new(-5, 7));
        assert!("10;20".parse::<Coordinate>().is_err());
        assert!("a,b".parse::<Coordinate>().is_err());
    }

    #[test]
    fn actions_use_tagged_json() {
        let json = r#"[
            {"type": "press_panel_key", "key": "q"},
            {"type": "press_specific_panel_key", "panel": "Custom", "custom_key": "f5"},
            {"type": "click", "positions": [100, 200], "modifiers": ["Shift"], "annotation": "drink"},
            {"type": "click", "positions": [[1, 1], [2, 2]]},
            {"type": "click", "use_saved_target": true},
            {"type": "return_mouse", "click_after_return": true},
            {"type": "wait", "duration": "tick_time"},
            {"type": "wait", "duration": 0.5},
            {"type": "run_macro", "macro_name": "B"}
        ]"#;
        let steps: Vec<Step> = serde_json::from_str(json).unwrap();
        assert_eq!(steps.len(), 9);
        assert_eq!(steps[2].annotation.as_deref(), Some("drink"));
        match &steps[2].action {
            Action::Click { positions, modifiers, .. } => {
                assert_eq!(positions, &ClickTargets::Single(Coordinate::new(100, 200)));
                assert_eq!(*modifiers, Modifiers::SHIFT);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(steps[3].action, click(vec![(1, 1), (2, 2)]));
        assert_eq!(
            steps[6].action,
            Action::Wait {
                duration: WaitDuration::Named("tick_time".into())
            }
        );

        let again: Vec<Step> = serde_json::from_str(&serde_json::to_string(&steps).unwrap()).unwrap();
        assert_eq!(again, steps);
    }

    #[test]
    fn max_positions_uses_largest_list() {
        let def = MacroDef::new(
            "dose",
            vec![click(vec![(1, 1)]), click(vec![(1, 1), (2, 2), (3, 3)])],
        );
        assert_eq!(def.max_positions_len(), 3);
        assert_eq!(MacroDef::new("empty", vec![]).max_positions_len(), 0);
    }

    #[test]
    fn validation_rules() {
        assert!(MacroDef::new("", vec![]).validate().is_err());

        let mut dose = MacroDef::new("dose", vec![click(vec![(1, 1)])]);
        dose.is_dose_macro = true;
        assert!(dose.validate().is_err());
        dose.dose_count = Some(0);
        assert!(dose.validate().is_err());
        dose.dose_count = Some(4);
        assert!(dose.validate().is_ok());

        let mut looped = MacroDef::new("loop", vec![]);
        looped.is_loop_macro = true;
        looped.loop_count = 0;
        assert!(looped.validate().is_err());
        looped.loop_count = UNBOUNDED;
        assert!(looped.validate().is_ok());
        assert_eq!(looped.iterations(), None);

        let mut scheduled = MacroDef::new("sched", vec![]);
        scheduled.is_scheduled = true;
        assert!(scheduled.validate().is_err());
        scheduled.schedule_interval = Some("5x".into());
        assert!(scheduled.validate().is_err());
        scheduled.schedule_interval = Some("5m1s".into());
        assert!(scheduled.validate().is_ok());

        assert!(MacroDef::new("bad click", vec![click(vec![])]).validate().is_err());
    }

    #[test]
    fn catalog_names_are_unique() {
        let a = MacroDef::new("A", vec![]);
        let b = MacroDef::new("B", vec![]);
        assert!(validate_catalog(&[a.clone(), b.clone()]).is_ok());
        assert!(validate_catalog(&[a.clone(), a.clone()]).is_err());

        let catalog = vec![a.clone(), b];
        assert!(validate_candidate(&catalog, &a, None).is_err());
        assert!(validate_candidate(&catalog, &a, Some("A")).is_ok());
        assert!(validate_candidate(&catalog, &MacroDef::new("B", vec![]), Some("A")).is_err());
    }
}
