//! Group start/stop of device recorders.
//!
//! The supervisor owns every [`DeviceRecorder`] and is the only place that
//! moves a device across the Idle / PreflightChecking / Stopped boundary.
//! Starting is all-or-nothing: the sink must answer a ping and every enabled
//! device must pass its identity check before any of them begins polling.

use crate::config::RecorderConfig;
use crate::error::{AppResult, DeviceFailure, RecorderError};
use crate::recorder::{DeviceRecorder, RecorderState, RecorderStatus, RecorderTask};
use crate::sink::{sink_for, TimeSeriesSink};
use crate::transport::{connector_for, Connector};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Point-in-time view of one device for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderSnapshot {
    pub id: String,
    pub label: String,
    pub table: String,
    pub endpoint: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub enabled: bool,
    #[serde(flatten)]
    pub status: RecorderStatus,
}

/// Outcome of a successful identity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreflightReport {
    pub device: String,
    pub identity: String,
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<DeviceRecorder>,
}

struct ManagedRecorder {
    task: RecorderTask,
    connector: Arc<dyn Connector>,
    enabled: bool,
    status: watch::Receiver<RecorderStatus>,
    /// `None` while the recorder is owned by its polling task.
    recorder: Option<DeviceRecorder>,
    running: Option<RunningLoop>,
}

impl ManagedRecorder {
    fn recorder(&self) -> AppResult<&DeviceRecorder> {
        self.recorder
            .as_ref()
            .ok_or(RecorderError::AlreadyRunning)
    }

    fn spawn(&mut self) -> AppResult<()> {
        let recorder = self.recorder.take().ok_or(RecorderError::AlreadyRunning)?;
        recorder.set_state(RecorderState::Polling);
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(recorder.run(stop_rx));
        self.running = Some(RunningLoop { stop, handle });
        Ok(())
    }

    /// Signal the polling task and take the recorder back once it has drained.
    async fn join(&mut self, sink: &Arc<dyn TimeSeriesSink>) -> AppResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        // A send error only means the loop already exited.
        let _ = running.stop.send(true);

        match running.handle.await {
            Ok(recorder) => {
                self.recorder = Some(recorder);
                Ok(())
            }
            Err(join_error) => {
                error!(device = %self.task.id, error = %join_error, "polling task panicked");
                let err = RecorderError::TaskPanicked(self.task.id.clone());
                let recorder = DeviceRecorder::new(
                    self.task.clone(),
                    Arc::clone(&self.connector),
                    Arc::clone(sink),
                );
                recorder.fault(&err);
                self.status = recorder.subscribe();
                self.recorder = Some(recorder);
                Err(err)
            }
        }
    }

    fn snapshot(&self) -> RecorderSnapshot {
        RecorderSnapshot {
            id: self.task.id.clone(),
            label: self.task.label.clone(),
            table: self.task.table.clone(),
            endpoint: self.connector.endpoint(),
            interval: self.task.interval,
            enabled: self.enabled,
            status: self.status.borrow().clone(),
        }
    }
}

/// Owns the device recorders and starts or stops them as a group.
pub struct RecorderSupervisor {
    sink: Arc<dyn TimeSeriesSink>,
    recorders: Vec<ManagedRecorder>,
    running: bool,
}

impl RecorderSupervisor {
    pub fn new(sink: Arc<dyn TimeSeriesSink>) -> Self {
        Self {
            sink,
            recorders: Vec::new(),
            running: false,
        }
    }

    /// Build a supervisor with the sink and devices described by `config`.
    pub fn from_config(config: &RecorderConfig) -> AppResult<Self> {
        let sink = sink_for(config.storage.backend, config.storage.output_dir.clone());
        let mut supervisor = Self::new(sink);
        for (task, device) in config.tasks()?.into_iter().zip(&config.devices) {
            let connector = connector_for(&device.transport)?;
            supervisor.add_device(task, connector)?;
        }
        Ok(supervisor)
    }

    /// Register a device. Ids must be unique.
    pub fn add_device(&mut self, task: RecorderTask, connector: Arc<dyn Connector>) -> AppResult<()> {
        if self.recorders.iter().any(|m| m.task.id == task.id) {
            return Err(RecorderError::DuplicateDevice(task.id));
        }
        let recorder = DeviceRecorder::new(task.clone(), Arc::clone(&connector), Arc::clone(&self.sink));
        info!(device = %task.id, endpoint = %connector.endpoint(), enabled = task.enabled, "device registered");
        self.recorders.push(ManagedRecorder {
            enabled: task.enabled,
            status: recorder.subscribe(),
            task,
            connector,
            recorder: Some(recorder),
            running: None,
        });
        Ok(())
    }

    pub fn sink(&self) -> &Arc<dyn TimeSeriesSink> {
        &self.sink
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Devices whose polling loop is running or draining.
    pub fn active_devices(&self) -> usize {
        self.recorders
            .iter()
            .filter(|m| m.status.borrow().state.is_active())
            .count()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.recorders.iter().map(|m| m.task.id.clone()).collect()
    }

    /// Status of every registered device, in registration order.
    pub fn status(&self) -> Vec<RecorderSnapshot> {
        self.recorders.iter().map(ManagedRecorder::snapshot).collect()
    }

    /// Status of one device.
    pub fn device_status(&self, id: &str) -> AppResult<RecorderSnapshot> {
        self.recorders
            .iter()
            .find(|m| m.task.id == id)
            .map(ManagedRecorder::snapshot)
            .ok_or_else(|| RecorderError::UnknownDevice(id.to_string()))
    }

    /// Enable or disable a device.
    ///
    /// While recording, disabling a device drains its loop and enabling one
    /// runs its identity check and starts polling if it passes.
    pub async fn set_enabled(&mut self, id: &str, enabled: bool) -> AppResult<()> {
        let running = self.running;
        let sink = Arc::clone(&self.sink);
        let managed = self
            .recorders
            .iter_mut()
            .find(|m| m.task.id == id)
            .ok_or_else(|| RecorderError::UnknownDevice(id.to_string()))?;
        if managed.enabled == enabled {
            return Ok(());
        }
        managed.enabled = enabled;
        info!(device = %id, enabled, "device enable changed");

        if !running {
            return Ok(());
        }
        if enabled {
            managed.recorder()?.preflight().await?;
            managed.spawn()
        } else {
            managed.join(&sink).await
        }
    }

    async fn ping_sink(&self) -> AppResult<()> {
        self.sink.ping().await.map_err(|e| {
            error!(error = %e, "storage endpoint unreachable");
            RecorderError::SinkUnavailable(e.to_string())
        })
    }

    /// Run the identity check on every enabled device concurrently.
    ///
    /// Devices that pass are left in `PreflightChecking`; failing devices are
    /// `Faulted`.
    async fn preflight_enabled(&self) -> AppResult<Result<Vec<PreflightReport>, Vec<DeviceFailure>>> {
        let enabled: Vec<&ManagedRecorder> = self.recorders.iter().filter(|m| m.enabled).collect();
        if enabled.is_empty() {
            return Err(RecorderError::NoEnabledDevices);
        }

        let mut recorders = Vec::with_capacity(enabled.len());
        for managed in &enabled {
            recorders.push(managed.recorder()?);
        }
        let outcomes = join_all(recorders.iter().map(|r| r.preflight())).await;

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        for (recorder, outcome) in recorders.iter().zip(outcomes) {
            match outcome {
                Ok(identity) => reports.push(PreflightReport {
                    device: recorder.id().to_string(),
                    identity,
                }),
                Err(error) => failures.push(DeviceFailure {
                    device: recorder.id().to_string(),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(Ok(reports))
        } else {
            Ok(Err(failures))
        }
    }

    /// Return devices that passed a check back to `Idle`. Failed devices stay
    /// `Faulted` and are checked again on the next start.
    fn reset_passed(&self) {
        for recorder in self.recorders.iter().filter_map(|m| m.recorder.as_ref()) {
            if recorder.state() == RecorderState::PreflightChecking {
                recorder.set_state(RecorderState::Idle);
            }
        }
    }

    /// Dry run: ping the sink and check every enabled device without
    /// starting anything.
    pub async fn check(&self) -> AppResult<Vec<PreflightReport>> {
        if self.running {
            return Err(RecorderError::AlreadyRunning);
        }
        self.ping_sink().await?;
        match self.preflight_enabled().await? {
            Ok(reports) => {
                self.reset_passed();
                Ok(reports)
            }
            Err(failures) => {
                self.reset_passed();
                Err(RecorderError::PreflightFailed(failures))
            }
        }
    }

    /// Start recording on every enabled device.
    ///
    /// Fails with `SinkUnavailable` before touching any device if the sink
    /// does not answer, and with `PreflightFailed` naming every failing
    /// device if any identity check fails. In both cases nothing is polling
    /// afterwards.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.running {
            return Err(RecorderError::AlreadyRunning);
        }
        if !self.recorders.iter().any(|m| m.enabled) {
            return Err(RecorderError::NoEnabledDevices);
        }
        for managed in self.recorders.iter().filter(|m| m.enabled) {
            let state = managed.recorder()?.state();
            if !state.can_start() {
                return Err(RecorderError::Configuration(format!(
                    "device '{}' cannot start from state {}",
                    managed.task.id, state
                )));
            }
        }

        self.ping_sink().await?;
        let reports = match self.preflight_enabled().await? {
            Ok(reports) => reports,
            Err(failures) => {
                self.reset_passed();
                for failure in &failures {
                    warn!(device = %failure.device, error = %failure.error, "pre-flight failed");
                }
                return Err(RecorderError::PreflightFailed(failures));
            }
        };

        for managed in self.recorders.iter_mut().filter(|m| m.enabled) {
            managed.spawn()?;
        }
        self.running = true;
        info!(devices = reports.len(), "recording started");
        Ok(())
    }

    /// Stop every polling loop and wait for all of them to reach `Stopped`.
    ///
    /// Each loop finishes its in-flight cycle first. Calling `stop` when
    /// nothing is running is a no-op.
    pub async fn stop(&mut self) -> AppResult<()> {
        if !self.running {
            return Ok(());
        }
        info!("stopping all recorders");

        let sink = Arc::clone(&self.sink);
        let results = join_all(self.recorders.iter_mut().map(|m| m.join(&sink))).await;
        self.running = false;

        if let Err(err) = self.sink.flush().await {
            warn!(error = %err, "sink flush failed after stop");
        }
        info!("recording stopped");
        results.into_iter().collect::<AppResult<Vec<()>>>().map(|_| ())
    }
}

impl Drop for RecorderSupervisor {
    fn drop(&mut self) {
        // Dropping the stop senders makes each loop drain on its own.
        if self.running {
            warn!(
                active = self.active_devices(),
                "supervisor dropped while recording; loops will drain in the background"
            );
        }
    }
}
