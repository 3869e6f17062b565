//! Core library for the daq_recorder application.
//!
//! Polls scientific instruments on a schedule and records each reading into a
//! time-series store. Each device runs its own polling loop; a supervisor
//! starts the loops as a group once storage and every instrument identity have
//! been verified.
//!
//! - [`command`]: validated command construction and reply decoding
//! - [`transport`]: serial and TCP device sessions
//! - [`recorder`]: the per-device polling loop
//! - [`supervisor`]: group start/stop and status
//! - [`sink`]: the time-series write contract and its backends

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod recorder;
pub mod sink;
pub mod supervisor;
pub mod transport;

pub use error::{AppResult, RecorderError};
