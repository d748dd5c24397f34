//! Stage/retry loop around repeated VM boots.
//!
//! Each stage boots the VM, monitors its serial output until a verdict, powers
//! the VM off again, and decides whether to retry the stage, move on, or stop
//! the run. Stage `k + 1` only starts after stage `k` reached its checkpoint.
use crate::config::HarnessConfig;
use crate::input::{Injector, SerialInput};
use crate::monitor::{self, MonitorOutcome, MonitorSettings, StreamMonitor, Verdict};
use crate::report::{AttemptRecord, RunOutcome, RunReport};
use crate::retry::{RetryBudget, RetryDecision};
use crate::signals::Shutdown;
use crate::transcript;
use crate::transport::SerialEndpoint;
use crate::vm::{VmError, VmHandle, VmLifecycle, VmState};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the orchestrator needs besides the hypervisor.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Checkpoint marker per stage, in order.
    pub checkpoints: Vec<String>,
    pub max_retries: u32,
    pub endpoint: SerialEndpoint,
    pub timeout: Duration,
    pub duplicate_line_limit: u32,
    pub chunk_capacity: usize,
    pub echo: bool,
    pub transcript: Option<PathBuf>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            checkpoints: config.stages.iter().map(|s| s.checkpoint.clone()).collect(),
            max_retries: config.retry.max_retries,
            endpoint: SerialEndpoint::new(
                &config.serial.socket_path,
                Duration::from_secs(config.serial.connect_timeout_secs),
            ),
            timeout: Duration::from_secs(config.monitor.timeout_secs),
            duplicate_line_limit: config.monitor.duplicate_line_limit,
            chunk_capacity: config.monitor.chunk_capacity,
            echo: config.monitor.echo,
            transcript: config.transcript_path().map(PathBuf::from),
        }
    }

    fn monitor_settings(&self, checkpoint: &str) -> MonitorSettings {
        MonitorSettings {
            checkpoint: checkpoint.to_string(),
            timeout: self.timeout,
            duplicate_line_limit: self.duplicate_line_limit,
            chunk_capacity: self.chunk_capacity,
            echo: self.echo,
            transcript: self.transcript.clone(),
        }
    }
}

/// Why an attempt produced no verdict.
#[derive(Debug)]
enum AttemptError {
    /// The VM did not start; counts as a failed attempt.
    Launch(VmError),
    /// The VM could not be powered off and is still up; ends the run.
    PowerOff(VmError),
    Interrupted,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Launch(e) => write!(f, "error starting VM: {e}"),
            AttemptError::PowerOff(e) => write!(f, "failed to shut down VM: {e}"),
            AttemptError::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Find or create the VM, wire up its serial port, and prepare its boot disk.
pub async fn provision<V: VmLifecycle>(
    vm: &V,
    name: &str,
    endpoint: &SerialEndpoint,
) -> Result<VmHandle, VmError> {
    let handle = vm.find_or_create(name).await?;
    vm.configure_serial(&handle, endpoint).await?;
    vm.ensure_boot_disk(&handle).await?;
    tracing::info!(vm = %handle.name, serial = %endpoint.path().display(), "VM ready");
    Ok(handle)
}

pub struct StageOrchestrator<'a, V: VmLifecycle> {
    vm: &'a V,
    handle: VmHandle,
    settings: OrchestratorSettings,
    shutdown: Shutdown,
}

impl<'a, V: VmLifecycle> StageOrchestrator<'a, V> {
    pub fn new(
        vm: &'a V,
        handle: VmHandle,
        settings: OrchestratorSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            vm,
            handle,
            settings,
            shutdown,
        }
    }

    /// Run every stage in order and report how the run went.
    pub async fn run_all(&mut self) -> RunReport {
        let mut report = RunReport::new();
        let outcome = self.run_stages(&mut report).await;
        match &outcome {
            RunOutcome::Completed => tracing::info!("all stages reached their checkpoint"),
            other => tracing::error!(outcome = ?other, "run did not complete"),
        }
        report.finish(outcome);
        report
    }

    async fn run_stages(&mut self, report: &mut RunReport) -> RunOutcome {
        let checkpoints = self.settings.checkpoints.clone();
        let last_stage = checkpoints.len().saturating_sub(1);
        let mut budget = RetryBudget::new(self.settings.max_retries);

        if let Some(path) = &self.settings.transcript {
            transcript::truncate(path);
        }

        for (stage, checkpoint) in checkpoints.iter().enumerate() {
            budget.reset();
            // Between last-stage reboots the guest carries on with the same
            // test run, so its output stays in one transcript.
            let mut keep_transcript = false;

            loop {
                if budget.is_exhausted() {
                    tracing::error!(
                        stage = stage + 1,
                        max_retries = budget.max_attempts(),
                        "maximum number of allowed retries exceeded, aborting"
                    );
                    return RunOutcome::RetriesExhausted { stage };
                }
                if self.shutdown.requested() {
                    return RunOutcome::Interrupted { stage };
                }
                if !keep_transcript {
                    if let Some(path) = &self.settings.transcript {
                        transcript::truncate(path);
                    }
                }

                let attempt = budget.attempt();
                tracing::info!(
                    stage = stage + 1,
                    attempt,
                    max_retries = budget.max_attempts(),
                    "running stage {}",
                    stage + 1
                );

                let started_at = Utc::now();
                let result = self.attempt(checkpoint).await;
                let mut record = AttemptRecord {
                    stage: stage + 1,
                    attempt,
                    started_at,
                    finished_at: Utc::now(),
                    verdict: None,
                    timed_out: false,
                    error: None,
                };

                match result {
                    Ok(outcome) => {
                        record.verdict = Some(outcome.verdict);
                        record.timed_out = outcome.timed_out;
                        report.record(record);

                        match outcome.verdict {
                            Verdict::CheckpointReached => {
                                tracing::info!(stage = stage + 1, attempt, "checkpoint reached");
                                break;
                            }
                            Verdict::Abort => {
                                tracing::error!(
                                    stage = stage + 1,
                                    attempt,
                                    "guest reported a failure"
                                );
                                return RunOutcome::Aborted { stage };
                            }
                            Verdict::Continue if stage == last_stage => {
                                tracing::info!(
                                    stage = stage + 1,
                                    timed_out = outcome.timed_out,
                                    "rebooting VM (retry {})",
                                    attempt
                                );
                                keep_transcript = true;
                            }
                            Verdict::Continue => {
                                tracing::warn!(
                                    stage = stage + 1,
                                    attempt,
                                    timed_out = outcome.timed_out,
                                    "attempt did not reach the checkpoint"
                                );
                                keep_transcript = false;
                            }
                        }
                    }
                    Err(AttemptError::PowerOff(e)) => {
                        record.error = Some(e.to_string());
                        report.record(record);
                        tracing::error!(error = %e, vm = %self.handle.name, "VM left running, aborting");
                        return RunOutcome::VmFailure {
                            stage: Some(stage),
                            error: e.to_string(),
                        };
                    }
                    Err(AttemptError::Interrupted) => {
                        report.record(record);
                        return RunOutcome::Interrupted { stage };
                    }
                    Err(e) => {
                        record.error = Some(e.to_string());
                        report.record(record);
                        tracing::warn!(stage = stage + 1, attempt, error = %e, "boot attempt failed");
                        keep_transcript = false;
                    }
                }

                if let RetryDecision::Retry { next_attempt } = budget.record_failure() {
                    tracing::debug!(
                        stage = stage + 1,
                        next_attempt,
                        remaining = budget.remaining(),
                        "retrying stage"
                    );
                }
            }
        }

        RunOutcome::Completed
    }

    /// Boot, monitor, and power the VM off again.
    async fn attempt(&mut self, checkpoint: &str) -> Result<MonitorOutcome, AttemptError> {
        if let Err(e) = self.vm.launch(&self.handle).await {
            self.power_down().await?;
            return Err(AttemptError::Launch(e));
        }
        tracing::info!(vm = %self.handle.name, "domain started");

        let monitored = self.monitor(checkpoint).await;
        self.power_down().await?;
        monitored
    }

    async fn monitor(&mut self, checkpoint: &str) -> Result<MonitorOutcome, AttemptError> {
        let stream = match self.settings.endpoint.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "no serial connection to the guest");
                return Ok(MonitorOutcome::finished(Verdict::Continue));
            }
        };
        let (reader, writer) = stream.into_split();
        let injector = Injector::new(SerialInput::new(writer), self.vm.keyboard(&self.handle));
        let monitor = StreamMonitor::new(self.settings.monitor_settings(checkpoint));
        let mut session = monitor::spawn(monitor, reader, injector);

        tokio::select! {
            outcome = session.wait() => Ok(outcome),
            _ = self.shutdown.wait() => {
                session.abort();
                Err(AttemptError::Interrupted)
            }
        }
    }

    /// Power the VM off if it is not already, then release it.
    ///
    /// Only a VM that refuses to power off and is not confirmed offline is an
    /// error; everything else is logged.
    async fn power_down(&self) -> Result<(), AttemptError> {
        let state = self.vm.current_state(&self.handle).await;
        if !matches!(state, Ok(VmState::Offline)) {
            tracing::debug!(vm = %self.handle.name, state = ?state, "powering off VM");
            if let Err(e) = self.vm.power_off(&self.handle).await {
                tracing::warn!(error = %e, vm = %self.handle.name, "failed to power off VM");
                match self.vm.current_state(&self.handle).await {
                    Ok(VmState::Offline) => {}
                    _ => return Err(AttemptError::PowerOff(e)),
                }
            }
        }

        if let Err(e) = self.vm.release(&self.handle).await {
            tracing::warn!(error = %e, vm = %self.handle.name, "failed to release VM");
        }
        Ok(())
    }
}
