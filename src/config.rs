//! Configuration management for tickmacro
//!
//! Handles the JSON configuration document (timings, key bindings, named
//! waits, positions and the macro catalog) and its debounced persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MacroError, Result};
use crate::keys::{KeySpec, SpecialKey};
use crate::plan::{Coordinate, MacroDef, Panel, validate_candidate};

/// How often the autosave thread checks the dirty flag.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Name of the conventional game tick entry in the wait table.
pub const TICK_TIME: &str = "tick_time";

/// Global timing and key settings. All times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub interface_switch_time: f64,
    pub action_registration_time_min: f64,
    pub action_registration_time_max: f64,
    pub mouse_move_duration: f64,
    pub task_queue_delay: f64,
    pub panel_key: KeySpec,
    pub specific_panel_keys: BTreeMap<Panel, KeySpec>,
    pub wait_times: BTreeMap<String, f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            interface_switch_time: 0.3,
            action_registration_time_min: 0.05,
            action_registration_time_max: 0.12,
            mouse_move_duration: 0.08,
            task_queue_delay: 0.5,
            panel_key: KeySpec::Char('q'),
            specific_panel_keys: BTreeMap::from([
                (Panel::Inventory, KeySpec::Special(SpecialKey::Esc)),
                (Panel::Prayer, KeySpec::Special(SpecialKey::F(5))),
                (Panel::Spells, KeySpec::Special(SpecialKey::F(6))),
            ]),
            wait_times: BTreeMap::from([(TICK_TIME.to_string(), 0.6)]),
        }
    }
}

impl Settings {
    /// Lower and upper bound of the randomized interaction wait, ordered.
    pub fn interaction_wait_bounds(&self) -> (f64, f64) {
        let a = self.action_registration_time_min.max(0.0);
        let b = self.action_registration_time_max.max(0.0);
        if a <= b { (a, b) } else { (b, a) }
    }

    pub fn average_interaction_wait(&self) -> f64 {
        let (min, max) = self.interaction_wait_bounds();
        (min + max) / 2.0
    }

    /// Resolve a named wait, falling back to the action registration time.
    pub fn resolve_wait(&self, name: &str) -> f64 {
        match self.wait_times.get(name) {
            Some(secs) => *secs,
            None => {
                tracing::warn!(wait = name, "Unknown wait time, using action registration time");
                self.action_registration_time_min.max(0.0)
            }
        }
    }

    pub fn tick_time(&self) -> f64 {
        self.wait_times.get(TICK_TIME).copied().unwrap_or(0.6)
    }

    pub fn validate(&self) -> Result<()> {
        let timings = [
            ("interface_switch_time", self.interface_switch_time),
            ("action_registration_time_min", self.action_registration_time_min),
            ("action_registration_time_max", self.action_registration_time_max),
            ("mouse_move_duration", self.mouse_move_duration),
            ("task_queue_delay", self.task_queue_delay),
        ];
        for (name, value) in timings.into_iter().chain(self.wait_times.iter().map(|(k, v)| (k.as_str(), *v))) {
            if !value.is_finite() || value < 0.0 {
                return Err(MacroError::Validation(format!(
                    "{} must be a non-negative number of seconds, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub settings: Settings,

    #[serde(default)]
    pub positions: BTreeMap<String, Coordinate>,

    #[serde(default)]
    pub macros: Vec<MacroDef>,

    /// Sections owned by other tools (`main`, `herb_cleaner`, ...), kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    pub fn find_macro(&self, name: &str) -> Option<&MacroDef> {
        self.macros.iter().find(|m| m.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }
}

pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("tickmacro");
    path.push("config.json");
    path
}

/// Shared, debounced configuration document.
pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<Config>,
    dirty: AtomicBool,
    /// Serializes writers so a flush never interleaves with another flush.
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load the document at `path`. A missing file is materialized with
    /// defaults; an unreadable one is logged and replaced by defaults in memory.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let (config, write_defaults) = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => (config, false),
                Err(e) => {
                    tracing::error!("Failed to parse {}: {}; using defaults", path.display(), e);
                    (Config::default(), false)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No configuration at {}, creating defaults", path.display());
                (Config::default(), true)
            }
            Err(e) => {
                tracing::error!("Failed to read {}: {}; using defaults", path.display(), e);
                (Config::default(), false)
            }
        };

        let store = Arc::new(ConfigStore::with_config(path, config));
        if write_defaults {
            store.mark_dirty();
            if let Err(e) = store.flush() {
                tracing::error!("Failed to write default configuration: {}", e);
            }
        }
        store
    }

    /// Wrap an in-memory document; nothing is read from `path`.
    pub fn with_config(path: impl Into<PathBuf>, config: Config) -> Self {
        ConfigStore {
            path: path.into(),
            config: Mutex::new(config),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point-in-time copy of the whole document.
    pub fn snapshot(&self) -> Config {
        self.config.lock().clone()
    }

    pub fn settings(&self) -> Settings {
        self.config.lock().settings.clone()
    }

    pub fn macros(&self) -> Vec<MacroDef> {
        self.config.lock().macros.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Apply `f` to the document and flag it for the next autosave.
    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        let result = f(&mut self.config.lock());
        self.mark_dirty();
        result
    }

    /// Replace the settings after validating them and save immediately.
    pub fn save_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        self.update(|config| config.settings = settings);
        self.flush()
    }

    pub fn set_wait_time(&self, name: &str, secs: f64) -> Result<()> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(MacroError::Validation(format!(
                "Wait {:?} must be a non-negative number of seconds",
                name
            )));
        }
        self.update(|config| {
            config.settings.wait_times.insert(name.to_string(), secs);
        });
        Ok(())
    }

    /// Insert or replace a macro after validation. `replacing` names the
    /// macro being edited, if any.
    pub fn upsert_macro(&self, def: MacroDef, replacing: Option<&str>) -> Result<()> {
        let mut config = self.config.lock();
        validate_candidate(&config.macros, &def, replacing)?;
        match replacing.and_then(|name| config.macros.iter().position(|m| m.name == name)) {
            Some(index) => config.macros[index] = def,
            None => config.macros.push(def),
        }
        drop(config);
        self.mark_dirty();
        Ok(())
    }

    pub fn remove_macro(&self, name: &str) -> bool {
        let removed = self.update(|config| {
            let before = config.macros.len();
            config.macros.retain(|m| m.name != name);
            before != config.macros.len()
        });
        if !removed {
            tracing::warn!("No macro named {:?} to remove", name);
        }
        removed
    }

    /// Write back a dose macro's counters; persisted on the next autosave.
    pub fn record_dose_state(&self, name: &str, call_count: u64, position_index: usize) {
        self.update(|config| {
            if let Some(def) = config.macros.iter_mut().find(|m| m.name == name) {
                def.call_count = call_count;
                def.current_position_index = position_index;
            }
        });
    }

    /// Write the document now if it is dirty. On failure the flag stays set
    /// so the next tick retries.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let json = match self.snapshot().to_json() {
            Ok(json) => json,
            Err(e) => {
                self.mark_dirty();
                return Err(e);
            }
        };
        if let Err(e) = write_atomically(&self.path, &json) {
            self.mark_dirty();
            return Err(e);
        }
        tracing::debug!("Saved configuration to {}", self.path.display());
        Ok(())
    }

    /// Flush regardless of the dirty flag (used on shutdown and explicit saves).
    pub fn force_flush(&self) -> Result<()> {
        self.mark_dirty();
        self.flush()
    }
}

fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| MacroError::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .map_err(|e| MacroError::Config(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| MacroError::Config(format!("Failed to replace {}: {}", path.display(), e)))?;
    Ok(())
}

/// Background thread that flushes the store whenever it is dirty.
pub struct Autosave {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Autosave {
    pub fn spawn(store: Arc<ConfigStore>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(0);
        let handle = thread::Builder::new()
            .name("autosave".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = store.flush() {
                                tracing::error!("Autosave failed, will retry: {}", e);
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                if let Err(e) = store.flush() {
                    tracing::error!("Final save failed: {}", e);
                }
            })?;
        Ok(Autosave {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread after one last flush.
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

impl Drop for Autosave {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Action, ClickTargets};
    use proptest::prelude::*;

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.positions.insert("bank".into(), Coordinate::new(10, 20));
        let mut def = MacroDef::new(
            "Drink",
            vec![Action::Click {
                use_saved_target: false,
                positions: ClickTargets::List(vec![Coordinate::new(1, 1), Coordinate::new(2, 2)]),
                modifiers: crate::keys::Modifiers::SHIFT,
            }],
        );
        def.is_dose_macro = true;
        def.dose_count = Some(4);
        def.hotkey = Some("alt+d".into());
        config.macros.push(def);
        config
            .extra
            .insert("herb_cleaner".into(), serde_json::json!({"enabled": true, "count": 3}));
        config
    }

    #[test]
    fn missing_file_materializes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = ConfigStore::open(&path);
        assert!(path.exists());
        assert_eq!(store.snapshot(), Config::default());
        assert!(!store.is_dirty());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let store = ConfigStore::open(&path);
        assert_eq!(store.settings(), Settings::default());
        // The broken file is left alone until something is saved.
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn extra_sections_survive_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{"panel_key": "w", "main": {"crafts": 27}, "herb_positions": [[1, 2]]}"#;
        fs::write(&path, json).unwrap();

        let store = ConfigStore::open(&path);
        let config = store.snapshot();
        assert_eq!(config.settings.panel_key, KeySpec::Char('w'));
        assert_eq!(config.settings.tick_time(), 0.6);
        assert_eq!(config.extra["main"]["crafts"], 27);

        store.force_flush().unwrap();
        let reloaded: Config = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn load_save_load_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, sample_config().to_json().unwrap()).unwrap();

        let first = ConfigStore::open(&path);
        first.force_flush().unwrap();
        let bytes_a = fs::read(&path).unwrap();

        let second = ConfigStore::open(&path);
        second.force_flush().unwrap();
        let bytes_b = fs::read(&path).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn flush_only_writes_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::with_config(&path, Config::default());
        store.flush().unwrap();
        assert!(!path.exists());

        store.set_wait_time("bank_wait", 1.2).unwrap();
        assert!(store.is_dirty());
        store.flush().unwrap();
        assert!(!store.is_dirty());
        let saved: Config = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.settings.wait_times["bank_wait"], 1.2);
    }

    #[test]
    fn failed_save_stays_dirty() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("config.json");
        fs::create_dir_all(path.join("occupied")).unwrap();
        let store = ConfigStore::with_config(&path, Config::default());
        store.mark_dirty();
        assert!(store.flush().is_err());
        assert!(store.is_dirty());
    }

    #[test]
    fn upsert_rejects_duplicates_and_records_dose() {
        let store = ConfigStore::with_config("unused.json", sample_config());
        assert!(store.upsert_macro(MacroDef::new("Drink", vec![]), None).is_err());
        store.upsert_macro(MacroDef::new("Bank", vec![]), None).unwrap();
        store
            .upsert_macro(MacroDef::new("Banking", vec![]), Some("Bank"))
            .unwrap();
        let names: Vec<String> = store.macros().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["Drink", "Banking"]);

        store.record_dose_state("Drink", 9, 2);
        let drink = store.snapshot().find_macro("Drink").cloned().unwrap();
        assert_eq!((drink.call_count, drink.current_position_index), (9, 2));
        assert!(store.is_dirty());
    }

    #[test]
    fn settings_validation_rejects_negative_times() {
        let mut settings = Settings::default();
        settings.mouse_move_duration = -0.1;
        let store = ConfigStore::with_config("unused.json", Config::default());
        assert!(store.save_settings(settings).is_err());
        assert!(store.set_wait_time("tick_time", f64::NAN).is_err());
    }

    #[test]
    fn autosave_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = Arc::new(ConfigStore::with_config(&path, Config::default()));
        let autosave = Autosave::spawn(Arc::clone(&store), Duration::from_secs(60)).unwrap();
        store.set_wait_time("bank", 2.0).unwrap();
        autosave.shutdown();
        assert!(path.exists());
        assert!(!store.is_dirty());
    }

    #[test]
    fn autosave_flushes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = Arc::new(ConfigStore::with_config(&path, Config::default()));
        let _autosave = Autosave::spawn(Arc::clone(&store), Duration::from_millis(20)).unwrap();
        store.set_wait_time("bank", 2.0).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(path.exists());
    }

    #[test]
    fn floats_survive_a_save_load_cycle() {
        let mut config = sample_config();
        config.settings.wait_times.insert("bank".into(), 2.5022474595685518);
        let first = config.to_json().unwrap();
        let loaded: Config = serde_json::from_str(&first).unwrap();
        assert_eq!(loaded.settings.wait_times["bank"], 2.5022474595685518);
        assert_eq!(loaded.to_json().unwrap(), first);
    }

    proptest! {
        #[test]
        fn persistence_is_idempotent(
            tick in 0.0f64..5.0,
            waits in proptest::collection::btree_map("[a-z_]{1,8}", 0.0f64..10.0, 0..4),
            x in -3000i32..3000,
            y in -3000i32..3000,
            calls in 0u64..1000,
        ) {
            let mut config = sample_config();
            config.settings.wait_times = waits;
            config.settings.wait_times.insert(TICK_TIME.into(), tick);
            config.positions.insert("spot".into(), Coordinate::new(x, y));
            config.macros[0].call_count = calls;

            let first = config.to_json().unwrap();
            let loaded: Config = serde_json::from_str(&first).unwrap();
            let second = loaded.to_json().unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
