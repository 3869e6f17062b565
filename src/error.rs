//! Error types for the recorder.
//!
//! The taxonomy follows the way faults propagate through the system:
//!
//! - **`ValidationError`**: a command argument violates its declared constraint.
//!   Raised by the command codec before anything is transmitted and never retried.
//! - **`DecodeError`**: an instrument reply could not be parsed into the expected
//!   shape. Inside the polling loop the cycle is skipped and recording continues.
//! - **`TransportError`**: opening, writing to or reading from a device session
//!   failed. Skip-and-continue while polling, fatal during pre-flight.
//! - **`SinkError`**: the time-series store rejected a write or could not be reached.
//!
//! `RecorderError` consolidates these together with the start-up failures
//! (`IdentityMismatch`, `SinkUnavailable`, `PreflightFailed`) and configuration
//! problems. `#[from]` conversions let `?` lift the narrow errors into it.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the recorder error type.
pub type AppResult<T> = std::result::Result<T, RecorderError>;

/// A command argument failed its parameter constraint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{command}: parameter '{parameter}' expects {expected}, got {got}")]
    WrongKind {
        command: String,
        parameter: String,
        expected: String,
        got: String,
    },

    #[error("{command}: parameter '{parameter}' value {value} outside [{min}, {max}]")]
    OutOfRange {
        command: String,
        parameter: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("{command}: parameter '{parameter}' token '{token}' is not one of {allowed:?}")]
    UnknownToken {
        command: String,
        parameter: String,
        token: String,
        allowed: Vec<String>,
    },

    #[error("{command}: missing required parameter '{parameter}'")]
    MissingArgument { command: String, parameter: String },

    #[error("{command}: takes at most {expected} argument(s), got {got}")]
    TooManyArguments {
        command: String,
        expected: usize,
        got: usize,
    },

    #[error("{command}: no parameter named '{parameter}'")]
    UnknownParameter { command: String, parameter: String },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{command}: template formatting failed: {reason}")]
    Template { command: String, reason: String },
}

/// An instrument reply did not match the expected shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty reply")]
    EmptyReply,

    #[error("field {index} is not numeric: '{raw}'")]
    NotNumeric { index: usize, raw: String },

    #[error("instrument reported NaN in field {index} (measurement timed out)")]
    NotANumber { index: usize },

    #[error("expected {expected} field(s), got {got}")]
    FieldCount { expected: usize, got: usize },

    #[error("reply has no field {index}: '{reply}'")]
    MissingField { index: usize, reply: String },
}

/// A device session could not be opened or used.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },

    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} waiting for a reply from {endpoint}")]
    Timeout {
        endpoint: String,
        timeout: std::time::Duration,
    },

    #[error("{endpoint} closed the connection")]
    Closed { endpoint: String },

    #[error("session to {endpoint} is not open")]
    NotOpen { endpoint: String },

    #[error("reply from {endpoint} is not valid ASCII text")]
    InvalidText { endpoint: String },

    #[error("reply from {endpoint} exceeds {limit} bytes without a line terminator")]
    ReplyTooLong { endpoint: String, limit: usize },
}

/// The time-series store rejected an operation.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("storage endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("write to table '{table}' failed: {reason}")]
    Write { table: String, reason: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(String),
}

/// One device that failed pre-flight, with the reason.
#[derive(Debug)]
pub struct DeviceFailure {
    pub device: String,
    pub error: RecorderError,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.device, self.error)
    }
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Identity mismatch on '{device}': expected '{expected}', got '{actual}'")]
    IdentityMismatch {
        device: String,
        expected: String,
        actual: String,
    },

    #[error("Storage endpoint unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Pre-flight failed for {} device(s): {}", .0.len(), format_failures(.0))]
    PreflightFailed(Vec<DeviceFailure>),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Recorder is already running")]
    AlreadyRunning,

    #[error("No enabled devices to record")]
    NoEnabledDevices,

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Duplicate device id '{0}'")]
    DuplicateDevice(String),

    #[error("Recorder task for '{0}' panicked")]
    TaskPanicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for RecorderError {
    fn from(err: figment::Error) -> Self {
        RecorderError::Config(Box::new(err))
    }
}

impl RecorderError {
    /// Failures that are contained within one poll cycle: the cycle is skipped
    /// and the loop carries on at its next scheduled slot.
    pub fn is_cycle_local(&self) -> bool {
        matches!(
            self,
            RecorderError::Decode(_) | RecorderError::Transport(_) | RecorderError::Sink(_)
        )
    }
}

fn format_failures(failures: &[DeviceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
