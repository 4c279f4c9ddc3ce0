//! Runs one macro's plan against an [`InputEffector`].

use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use rand::rngs::ThreadRng;

use super::{AbortReason, Engine, EngineEvent, Flow, MacroRuntime, Outcome};
use crate::clock::seconds;
use crate::config::Settings;
use crate::effector::InputEffector;
use crate::error::{MacroError, Result};
use crate::keys::{KeySpec, Modifiers};
use crate::plan::{Action, Coordinate, Panel, WaitDuration};
use crate::progress::ProcedureEstimate;

pub(crate) struct Executor<'a, E: InputEffector> {
    engine: &'a Engine,
    effector: &'a mut E,
    /// The queued macro; its active flag governs nested runs too.
    top: &'a MacroRuntime,
    settings: Settings,
    origin: Coordinate,
    /// Names of the macros currently executing, outermost first.
    stack: Vec<String>,
    rng: ThreadRng,
}

impl<'a, E: InputEffector> Executor<'a, E> {
    pub(crate) fn new(engine: &'a Engine, effector: &'a mut E, top: &'a MacroRuntime) -> Self {
        Executor {
            engine,
            effector,
            top,
            settings: engine.store.settings(),
            origin: Coordinate::default(),
            stack: Vec::new(),
            rng: rand::rng(),
        }
    }

    pub(crate) fn run(mut self) -> Result<Outcome> {
        let top = self.top;
        self.origin = self.effector.position()?;
        tracing::debug!(macro_name = top.name(), origin = %self.origin, "Captured origin");

        let clock = self.engine.clock();
        let progress = self.engine.progress();
        let iterations = top.def().iterations();
        let per_step = seconds(self.settings.average_interaction_wait() + self.settings.interface_switch_time);
        progress.begin_run(
            top.name(),
            &ProcedureEstimate::for_macro(top.def(), &self.settings),
            per_step,
            iterations,
            clock.now(),
        );

        let mut index = 0;
        while iterations.is_none_or(|n| index < n) {
            if let Flow::Abort(reason) = self.check() {
                return Ok(Outcome::Aborted(reason));
            }
            top.loop_index.store(index, Ordering::SeqCst);
            progress.begin_iteration(index, clock.now());

            if let Some(reason) = self.run_plan(top, true)? {
                return Ok(Outcome::Aborted(reason));
            }

            if let Some(average) = progress.end_iteration(clock.now()) {
                if top.def().is_loop_macro {
                    tracing::info!(
                        macro_name = top.name(),
                        "Iteration {} done, average {:.2}s",
                        index + 1,
                        average.as_secs_f64()
                    );
                }
                self.engine.emit(EngineEvent::IterationFinished {
                    name: top.name().to_string(),
                    index,
                    average,
                });
            }
            index += 1;
        }
        Ok(Outcome::Completed)
    }

    fn check(&self) -> Flow {
        self.engine.control.cooperative_check(self.top.active_flag())
    }

    /// Pause-aware sleep. Returns why the macro has to give up, if it does.
    fn sleep(&self, duration: Duration) -> Option<AbortReason> {
        let flow = self
            .engine
            .control
            .sleep_observing(self.engine.clock.as_ref(), duration, self.top.active_flag());
        match flow {
            Flow::Abort(reason) => Some(reason),
            Flow::Continue => None,
        }
    }

    /// One pass over `runtime`'s actions. Dose macros count the pass once if
    /// it dispatched any click.
    fn run_plan(&mut self, runtime: &MacroRuntime, track_progress: bool) -> Result<Option<AbortReason>> {
        self.stack.push(runtime.name().to_string());
        let mut clicked = false;
        let result = self.run_actions(runtime, track_progress, &mut clicked);
        self.stack.pop();

        if clicked {
            if let Some(dose_count) = runtime.def().dose() {
                let state = runtime.bump_dose(dose_count);
                tracing::debug!(
                    macro_name = runtime.name(),
                    call_count = state.call_count,
                    position_index = state.position_index,
                    "Dose advanced"
                );
                self.engine
                    .store
                    .record_dose_state(runtime.name(), state.call_count, state.position_index);
            }
        }
        result
    }

    fn run_actions(
        &mut self,
        runtime: &MacroRuntime,
        track_progress: bool,
        clicked: &mut bool,
    ) -> Result<Option<AbortReason>> {
        for step in &runtime.def().actions {
            if let Flow::Abort(reason) = self.check() {
                return Ok(Some(reason));
            }
            match &step.annotation {
                Some(note) => tracing::debug!(macro_name = runtime.name(), action = step.action.kind(), "{}", note),
                None => tracing::debug!(macro_name = runtime.name(), action = step.action.kind(), "Action"),
            }

            let abort = match &step.action {
                Action::Click {
                    use_saved_target,
                    positions,
                    modifiers,
                } => {
                    let targets = self.click_targets(runtime, *use_saved_target, positions.as_slice());
                    let (count, abort) = self.click(&targets, modifiers)?;
                    *clicked |= count > 0;
                    abort
                }
                other => self.run_action(runtime, other)?,
            };
            if abort.is_some() {
                return Ok(abort);
            }
            if track_progress {
                self.engine.progress.step_done();
            }
        }
        Ok(None)
    }

    fn run_action(&mut self, runtime: &MacroRuntime, action: &Action) -> Result<Option<AbortReason>> {
        match action {
            Action::PressPanelKey { key } => self.effector.tap(key)?,
            Action::PressSpecificPanelKey { panel, custom_key } => {
                let key = match panel {
                    Panel::Custom => custom_key.clone(),
                    other => self.settings.specific_panel_keys.get(other).cloned(),
                };
                match key {
                    Some(key) => self.effector.tap(&key)?,
                    None => self.skip(runtime, format!("no key bound for the {:?} panel", panel)),
                }
            }
            Action::ReturnMouse { click_after_return } => {
                self.effector
                    .move_to(self.origin, seconds(self.settings.mouse_move_duration))?;
                if *click_after_return {
                    self.effector.click()?;
                }
            }
            Action::Wait { duration } => {
                let secs = match duration {
                    WaitDuration::Seconds(secs) => *secs,
                    WaitDuration::Named(name) => self.settings.resolve_wait(name),
                };
                return Ok(self.sleep(seconds(secs)));
            }
            Action::RunMacro { macro_name } => return self.run_nested(runtime, macro_name),
            Action::Click { .. } => {}
        }
        Ok(None)
    }

    /// Run another macro's plan inline, once, with the shared origin.
    fn run_nested(&mut self, runtime: &MacroRuntime, name: &str) -> Result<Option<AbortReason>> {
        if self.stack.iter().any(|running| running == name) {
            self.skip(runtime, MacroError::Recursion(name.to_string()).to_string());
            return Ok(None);
        }
        let Some(nested) = self.engine.find_macro(name) else {
            self.skip(runtime, MacroError::UnknownMacro(name.to_string()).to_string());
            return Ok(None);
        };
        tracing::debug!(macro_name = runtime.name(), nested = name, "Running nested macro");
        self.run_plan(&nested, false)
    }

    fn skip(&self, runtime: &MacroRuntime, reason: String) {
        tracing::warn!(macro_name = runtime.name(), "Skipped action: {}", reason);
        self.engine.emit(EngineEvent::ActionSkipped {
            name: runtime.name().to_string(),
            reason,
        });
    }

    fn click_targets(&self, runtime: &MacroRuntime, use_saved_target: bool, positions: &[Coordinate]) -> Vec<Coordinate> {
        if use_saved_target {
            vec![self.origin]
        } else if runtime.def().dose().is_some() && !positions.is_empty() {
            let index = runtime.dose_state().position_index % positions.len();
            vec![positions[index]]
        } else {
            positions.to_vec()
        }
    }

    /// Hold `modifiers` around a click on each target. Returns how many clicks
    /// were dispatched. Modifiers are released even when aborting or failing.
    fn click(&mut self, targets: &[Coordinate], modifiers: &Modifiers) -> Result<(usize, Option<AbortReason>)> {
        let wait = self.interaction_wait();
        let held = modifiers.press_order();
        let mut pressed: Vec<&KeySpec> = Vec::with_capacity(held.len());

        let mut result = Ok((0, None));
        for key in &held {
            if let Err(e) = self.effector.key_down(key) {
                result = Err(e);
                break;
            }
            pressed.push(key);
        }
        if result.is_ok() {
            result = self.click_each(targets, wait);
        }

        for key in pressed.iter().rev() {
            if let Err(e) = self.effector.key_up(key) {
                tracing::warn!("Failed to release {}: {}", key, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn click_each(&mut self, targets: &[Coordinate], wait: Duration) -> Result<(usize, Option<AbortReason>)> {
        let move_duration = seconds(self.settings.mouse_move_duration);
        for (done, target) in targets.iter().enumerate() {
            if let Flow::Abort(reason) = self.check() {
                return Ok((done, Some(reason)));
            }
            self.effector.move_to(*target, move_duration)?;
            if let Some(reason) = self.sleep(wait) {
                return Ok((done, Some(reason)));
            }
            self.effector.click()?;
        }
        Ok((targets.len(), None))
    }

    /// One uniform sample in [min, max], shared by every sleep of an action.
    fn interaction_wait(&mut self) -> Duration {
        let (min, max) = self.settings.interaction_wait_bounds();
        let secs = if min < max && max.is_finite() {
            self.rng.random_range(min..=max)
        } else {
            min
        };
        seconds(secs)
    }
}
