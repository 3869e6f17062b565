//! Per-device polling loop.
//!
//! A [`DeviceRecorder`] owns one device: it verifies the instrument identity
//! before recording starts, then polls on a fixed interval. Every cycle opens
//! a fresh session, sends the measurement query, decodes the reply, publishes
//! one [`MeasurementRecord`] and closes the session again.
//!
//! # State machine
//!
//! ```text
//! Idle ──► PreflightChecking ──► Polling ──► Draining ──► Stopped
//!               │                   │                        │
//!               └──► Faulted ◄──────┘        (restart) ◄─────┘
//! ```
//!
//! Transport, decode and sink failures inside a cycle are recorded as the
//! last error and the cycle is skipped. Identity mismatches and validation
//! errors fault the recorder.

use crate::command::fs740::{self, IDENTIFY};
use crate::command::{decode, decode_identity, Arg, CommandSpec, ReplyShape};
use crate::error::{AppResult, DecodeError, RecorderError, ValidationError};
use crate::sink::{MeasurementRecord, TimeSeriesSink};
use crate::transport::{Connector, TransportSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one device recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecorderState {
    Idle,
    PreflightChecking,
    Polling,
    Draining,
    Stopped,
    Faulted,
}

impl RecorderState {
    /// Whether a polling loop is (or may still be) active.
    pub fn is_active(self) -> bool {
        matches!(self, RecorderState::Polling | RecorderState::Draining)
    }

    /// States from which the supervisor may start a pre-flight check.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            RecorderState::Idle | RecorderState::Stopped | RecorderState::Faulted
        )
    }
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::Idle => "idle",
            RecorderState::PreflightChecking => "preflight",
            RecorderState::Polling => "polling",
            RecorderState::Draining => "draining",
            RecorderState::Stopped => "stopped",
            RecorderState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Live state published by a recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub state: RecorderState,
    /// Poll cycles attempted since the recorder was created.
    pub cycles: u64,
    pub failed_cycles: u64,
    pub records_published: u64,
    pub last_error: Option<String>,
    pub last_record_at: Option<DateTime<Utc>>,
}

impl Default for RecorderStatus {
    fn default() -> Self {
        Self {
            state: RecorderState::Idle,
            cycles: 0,
            failed_cycles: 0,
            records_published: 0,
            last_error: None,
            last_record_at: None,
        }
    }
}

/// Expected answer to the identity query.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityCheck {
    pub expected: String,
    /// Comma-separated field of the `*IDN?` reply to compare; `None` compares
    /// the whole reply.
    pub field: Option<usize>,
}

impl IdentityCheck {
    pub fn new(expected: impl Into<String>, field: Option<usize>) -> Self {
        Self {
            expected: expected.into(),
            field,
        }
    }
}

/// The query issued every cycle and the names given to its reply values.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPlan {
    pub command: CommandSpec,
    pub args: BTreeMap<String, Arg>,
    pub fields: Vec<String>,
}

impl MeasurementPlan {
    pub fn new(command: CommandSpec, args: BTreeMap<String, Arg>, fields: Vec<String>) -> Self {
        Self {
            command,
            args,
            fields,
        }
    }

    /// Wire string for the measurement query.
    pub fn request(&self) -> Result<String, ValidationError> {
        self.command.build_named(&self.args)
    }

    pub fn reply_shape(&self) -> ReplyShape {
        ReplyShape::for_fields(self.fields.len())
    }

    /// Pair decoded values with field names.
    pub fn record(
        &self,
        table: &str,
        values: &[f64],
        timestamp: DateTime<Utc>,
    ) -> Result<MeasurementRecord, DecodeError> {
        if values.len() != self.fields.len() {
            return Err(DecodeError::FieldCount {
                expected: self.fields.len(),
                got: values.len(),
            });
        }
        let fields = self
            .fields
            .iter()
            .cloned()
            .zip(values.iter().copied())
            .collect();
        Ok(MeasurementRecord {
            table: table.to_string(),
            timestamp,
            fields,
        })
    }
}

/// Static configuration of one device, resolved when the configuration is
/// loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderTask {
    pub id: String,
    pub label: String,
    pub table: String,
    pub interval: Duration,
    pub enabled: bool,
    pub identity: IdentityCheck,
    pub measurement: MeasurementPlan,
}

impl RecorderTask {
    /// A task recording the FS740 frequency on channel 1 with default
    /// arguments.
    pub fn fs740_frequency(
        id: impl Into<String>,
        table: impl Into<String>,
        interval: Duration,
    ) -> AppResult<Self> {
        let command = fs740::catalog()
            .get("measure_frequency")
            .cloned()
            .ok_or_else(|| ValidationError::UnknownCommand("measure_frequency".to_string()))?;
        let id = id.into();
        Ok(Self {
            label: id.clone(),
            id,
            table: table.into(),
            interval,
            enabled: true,
            identity: IdentityCheck::new("FS740", Some(1)),
            measurement: MeasurementPlan::new(
                command,
                BTreeMap::new(),
                vec!["frequency".to_string()],
            ),
        })
    }
}

/// Polls one device and publishes its measurements.
pub struct DeviceRecorder {
    task: RecorderTask,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn TimeSeriesSink>,
    status: watch::Sender<RecorderStatus>,
}

impl DeviceRecorder {
    pub fn new(
        task: RecorderTask,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn TimeSeriesSink>,
    ) -> Self {
        let (status, _) = watch::channel(RecorderStatus::default());
        Self {
            task,
            connector,
            sink,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn task(&self) -> &RecorderTask {
        &self.task
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Receiver for status updates.
    pub fn subscribe(&self) -> watch::Receiver<RecorderStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> RecorderState {
        self.status.borrow().state
    }

    pub(crate) fn set_state(&self, state: RecorderState) {
        let previous = self.state();
        if previous != state {
            self.status.send_modify(|status| status.state = state);
            debug!(device = %self.task.id, from = %previous, to = %state, "state change");
        }
    }

    pub(crate) fn fault(&self, err: &RecorderError) {
        error!(device = %self.task.id, error = %err, "recorder faulted");
        self.status.send_modify(|status| {
            status.state = RecorderState::Faulted;
            status.last_error = Some(err.to_string());
        });
    }

    /// Verify the instrument identity.
    ///
    /// Opens one session, issues the identity query and closes the session
    /// whatever the outcome. Returns the compared identity on success. On
    /// failure the recorder is left `Faulted`.
    pub async fn preflight(&self) -> AppResult<String> {
        self.set_state(RecorderState::PreflightChecking);
        match self.verify_identity().await {
            Ok(identity) => {
                info!(device = %self.task.id, identity = %identity, "pre-flight passed");
                Ok(identity)
            }
            Err(err) => {
                self.fault(&err);
                Err(err)
            }
        }
    }

    async fn verify_identity(&self) -> AppResult<String> {
        // Nothing is transmitted unless the measurement query is valid.
        self.task.measurement.request()?;
        let request = fs740::catalog()
            .get(IDENTIFY)
            .ok_or_else(|| ValidationError::UnknownCommand(IDENTIFY.to_string()))?
            .build(&[])?;

        let mut session = self.connector.open().await?;
        let reply = session.query(&request).await;
        self.close_session(session.as_mut()).await;
        let reply = reply?;

        let identity = match decode_identity(&reply, self.task.identity.field) {
            Ok(identity) => identity,
            Err(DecodeError::MissingField { .. }) => {
                return Err(self.mismatch(reply.trim()));
            }
            Err(err) => return Err(err.into()),
        };
        if identity != self.task.identity.expected {
            return Err(self.mismatch(&identity));
        }
        Ok(identity)
    }

    fn mismatch(&self, actual: &str) -> RecorderError {
        RecorderError::IdentityMismatch {
            device: self.task.id.clone(),
            expected: self.task.identity.expected.clone(),
            actual: actual.to_string(),
        }
    }

    /// Run one poll cycle: open, query, decode, publish, close.
    pub async fn poll_once(&self) -> AppResult<MeasurementRecord> {
        let request = self.task.measurement.request()?;
        let mut session = self.connector.open().await?;
        let result = self.exchange(session.as_mut(), &request).await;
        self.close_session(session.as_mut()).await;
        result
    }

    async fn exchange(
        &self,
        session: &mut dyn TransportSession,
        request: &str,
    ) -> AppResult<MeasurementRecord> {
        let reply = session.query(request).await?;
        debug!(device = %self.task.id, request, reply = %reply, "measurement reply");
        let decoded = decode(&reply, self.task.measurement.reply_shape())?;
        let record = self
            .task
            .measurement
            .record(&self.task.table, &decoded.values(), Utc::now())?;
        self.sink.write(&record).await?;
        Ok(record)
    }

    /// Run one cycle to completion. A stop request seen meanwhile moves the
    /// recorder to `Draining` without cutting the cycle short.
    async fn poll_watching_stop(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> (AppResult<MeasurementRecord>, bool) {
        let poll = self.poll_once();
        tokio::pin!(poll);
        let mut draining = false;
        loop {
            tokio::select! {
                result = &mut poll => return (result, draining),
                changed = stop.changed(), if !draining => {
                    if changed.is_err() || *stop.borrow_and_update() {
                        draining = true;
                        self.set_state(RecorderState::Draining);
                    }
                }
            }
        }
    }

    async fn close_session(&self, session: &mut dyn TransportSession) {
        if let Err(err) = session.close().await {
            warn!(device = %self.task.id, endpoint = session.endpoint(), error = %err, "session close failed");
        }
    }

    /// Poll until `stop` turns true (or its sender is dropped), then drain
    /// and return the recorder so it can be started again.
    ///
    /// The stop signal is watched throughout. Once it is seen the recorder
    /// reports `Draining`, but a cycle that has begun always runs to
    /// completion. The next
    /// cycle is scheduled from the start of the previous one, whether or not
    /// that cycle succeeded.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Self {
        self.set_state(RecorderState::Polling);
        info!(
            device = %self.task.id,
            table = %self.task.table,
            interval = ?self.task.interval,
            "polling started"
        );

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let started = Instant::now();
            let cycle = self.status.borrow().cycles + 1;
            let (result, draining) = self.poll_watching_stop(&mut stop).await;
            match result {
                Ok(record) => {
                    debug!(device = %self.task.id, cycle, fields = ?record.fields, "record published");
                    self.status.send_modify(|status| {
                        status.cycles += 1;
                        status.records_published += 1;
                        status.last_record_at = Some(record.timestamp);
                    });
                }
                Err(err) if err.is_cycle_local() => {
                    warn!(device = %self.task.id, cycle, error = %err, "cycle skipped");
                    self.status.send_modify(|status| {
                        status.cycles += 1;
                        status.failed_cycles += 1;
                        status.last_error = Some(err.to_string());
                    });
                }
                Err(err) => {
                    self.status.send_modify(|status| status.cycles += 1);
                    self.fault(&err);
                    return self;
                }
            }

            if draining || wait_for_next_cycle(&mut stop, started + self.task.interval).await {
                break;
            }
        }

        self.set_state(RecorderState::Draining);
        if let Err(err) = self.sink.flush().await {
            warn!(device = %self.task.id, error = %err, "sink flush failed while draining");
        }
        self.set_state(RecorderState::Stopped);
        info!(device = %self.task.id, cycles = self.status.borrow().cycles, "polling stopped");
        self
    }
}

/// Sleep until `deadline`. Returns true if a stop was requested meanwhile.
async fn wait_for_next_cycle(stop: &mut watch::Receiver<bool>, deadline: Instant) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return *stop.borrow(),
            changed = stop.changed() => match changed {
                Ok(()) if *stop.borrow_and_update() => return true,
                Ok(()) => continue,
                Err(_) => return true,
            },
        }
    }
}
