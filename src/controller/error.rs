//! Error types for the controller core.

use std::error::Error as StdError;
use std::fmt;

/// Errors raised by the process manager, communication hub, event router, and cost aggregator.
#[derive(Debug)]
pub enum ControllerError {
    ProtocolViolation(String),
    UnknownProcess(String),
    Transport(String),
    Persistence(std::io::Error),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            ControllerError::UnknownProcess(id) => write!(f, "unknown process: {id}"),
            ControllerError::Transport(msg) => write!(f, "transport error: {msg}"),
            ControllerError::Persistence(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl StdError for ControllerError {}

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Persistence(e)
    }
}
