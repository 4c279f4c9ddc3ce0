//! tickmacro - tick-synchronous desktop macro runner
//!
//! Macros are lists of key taps, clicks, waits and nested macro calls. They
//! are triggered by global hotkeys, UI buttons or interval schedules and run
//! one at a time on a single worker thread.

pub mod clock;
pub mod config;
pub mod effector;
pub mod engine;
pub mod error;
pub mod hotkey;
pub mod interval;
pub mod keys;
pub mod notification;
pub mod plan;
pub mod positions;
pub mod progress;

#[cfg(test)]
mod test_support;

pub use error::{MacroError, Result};
