//! Error types for tickmacro

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MacroError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown macro: {0}")]
    UnknownMacro(String),

    #[error("Recursive macro invocation: {0}")]
    Recursion(String),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Hotkey error: {0}")]
    Hotkey(String),

    #[error("Invalid key: {0}")]
    Key(String),

    #[error("Invalid schedule interval: {0}")]
    Interval(String),

    #[error("Position capture error: {0}")]
    Capture(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<enigo::NewConError> for MacroError {
    fn from(e: enigo::NewConError) -> Self {
        MacroError::Input(e.to_string())
    }
}

impl From<enigo::InputError> for MacroError {
    fn from(e: enigo::InputError) -> Self {
        MacroError::Input(e.to_string())
    }
}

impl From<rdev::ListenError> for MacroError {
    fn from(e: rdev::ListenError) -> Self {
        MacroError::Hotkey(format!("{:?}", e))
    }
}

pub type Result<T> = std::result::Result<T, MacroError>;
