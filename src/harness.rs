use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::types::LimitDefaults;
use crate::config::JudgeletConfig;
use crate::driver::{RoundDriver, RoundScript};
use crate::error::{JudgeletError, Result};
use crate::monitor::{LimitMonitor, MemoryGauge};
use crate::relay::{IoRelay, RelayOutput};
use crate::sandbox::{
    create_backend, ResourceLimits, SandboxBackend, SandboxSpec, Supervisor, TerminationReason,
};
use crate::verdict::{Evidence, Verdict, VerdictBuilder};

/// One execution as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Executable path (native) or image reference (docker)
    #[serde(alias = "image", alias = "executable")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub round_script: RoundScript,
    /// Milliseconds per round
    #[serde(default)]
    pub time_limit_per_round: Option<u64>,
    /// Milliseconds for the whole execution
    #[serde(default)]
    pub total_time_limit: Option<u64>,
    /// Bytes
    #[serde(default)]
    pub memory_limit: Option<u64>,
}

impl ExecutionRequest {
    pub fn from_json(content: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(content)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(JudgeletError::InvalidRequest(
                "program must not be empty".to_string(),
            ));
        }
        if let Some(step) = self.round_script.iter().find(|s| s.command.contains('\n')) {
            return Err(JudgeletError::InvalidRequest(format!(
                "command {:?} spans more than one line",
                step.command
            )));
        }
        if let Some(step) = self.round_script.iter().find(|s| s.argument.contains('\n')) {
            return Err(JudgeletError::InvalidRequest(format!(
                "argument {:?} spans more than one line",
                step.argument
            )));
        }
        Ok(())
    }

    /// Request limits, with `defaults` filling the gaps.
    pub fn limits(&self, defaults: &LimitDefaults) -> ResourceLimits {
        ResourceLimits {
            time_limit: Duration::from_millis(
                self.time_limit_per_round.unwrap_or(defaults.time_limit_ms),
            ),
            total_time_limit: Duration::from_millis(
                self.total_time_limit.unwrap_or(defaults.total_time_limit_ms),
            ),
            memory_limit: self.memory_limit.unwrap_or(defaults.memory_limit_bytes),
        }
    }

    fn sandbox_spec(&self, limits: ResourceLimits) -> SandboxSpec {
        SandboxSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            workdir: self.workdir.clone(),
            env_vars: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            limits,
        }
    }
}

/// Runs execution requests against one backend.
///
/// `execute` always yields a verdict: launch failures, relay faults and a
/// panicking driver all end up as `InternalError`, and the sandbox is torn
/// down on every path.
pub struct Harness {
    supervisor: Supervisor,
    config: JudgeletConfig,
    verdicts: VerdictBuilder,
}

impl Harness {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: JudgeletConfig) -> Self {
        let capabilities = backend.capabilities();
        if !capabilities.oom_detection {
            warn!(
                backend = backend.name(),
                "Backend cannot detect OOM kills; memory verdicts rely on sampling"
            );
        }

        Self {
            supervisor: Supervisor::new(backend, config.sandbox.grace_period()),
            verdicts: VerdictBuilder::new(config.verdict.precedence.clone()),
            config,
        }
    }

    /// Create the configured backend and wrap it in a harness.
    pub async fn from_config(config: JudgeletConfig) -> Result<Self> {
        let backend = create_backend(&config.sandbox).await?;
        if !backend.health_check().await? {
            return Err(JudgeletError::BackendNotAvailable {
                backend: backend.name().to_string(),
                reason: "health check failed".to_string(),
            });
        }
        Ok(Self::new(backend, config))
    }

    pub fn backend_name(&self) -> &str {
        self.supervisor.backend_name()
    }

    /// Run one request to completion. Cancelling `cancel` stops the sandbox
    /// and yields an `InternalError` verdict.
    pub async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken) -> Verdict {
        let started_at = Utc::now();

        if let Err(e) = request.validate() {
            warn!(error = %e, "Rejected execution request");
            return Verdict::launch_failure(&e.to_string(), started_at);
        }

        let limits = request.limits(&self.config.limits);
        let spec = request.sandbox_spec(limits);

        let mut handle = match self.supervisor.start(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(program = %spec.program, error = %e, "Failed to start sandbox");
                return Verdict::launch_failure(&e.to_string(), started_at);
            }
        };

        let instance = handle.instance();
        let info = instance.info();
        debug!(
            backend = %info.backend_type,
            instance = %info.instance_id,
            metadata = ?info.metadata,
            "Sandbox attached"
        );

        let latch = handle.latch();
        let gauge = Arc::new(MemoryGauge::new());

        let monitor = LimitMonitor::new(&limits, &self.config.monitor).spawn(
            instance,
            latch.clone(),
            handle.started_at(),
            gauge.clone(),
        );

        let cancel_link = {
            let latch = latch.clone();
            let exited = latch.exited_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = exited.cancelled() => {}
                    _ = cancel.cancelled() => {
                        if latch.request(TerminationReason::Cancelled) {
                            info!("Execution cancelled");
                        }
                    }
                }
            })
        };

        let driver_task = match handle.take_stdio() {
            Some(stdio) => {
                let mut relay = IoRelay::attach(stdio, latch.stop_token(), &self.config.relay);
                let driver = RoundDriver::new(
                    request.round_script,
                    &limits,
                    self.config.sandbox.exit_grace(),
                );
                let latch = latch.clone();
                let gauge = gauge.clone();
                let started = handle.started_at();
                Some(tokio::spawn(async move {
                    let outcome = driver.run(&mut relay, &latch, started, gauge).await;
                    (relay, outcome)
                }))
            }
            None => None,
        };

        let (relay, outcome, driver_fault) = match driver_task {
            Some(task) => match task.await {
                Ok((relay, outcome)) => (Some(relay), Some(outcome), None),
                Err(e) => {
                    error!(error = %e, "Round driver failed");
                    latch.request(TerminationReason::HarnessFault);
                    (None, None, Some(format!("round driver failed: {}", e)))
                }
            },
            None => {
                latch.request(TerminationReason::HarnessFault);
                (None, None, Some("sandbox streams unavailable".to_string()))
            }
        };

        let teardown = self.supervisor.teardown(handle).await;

        let _ = cancel_link.await;
        let report = match monitor.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Limit monitor failed");
                Default::default()
            }
        };

        let relay_output = match relay {
            Some(relay) => relay.finish(self.config.sandbox.grace_period()).await,
            None => RelayOutput::default(),
        };

        let (rounds, failure) = match outcome {
            Some(outcome) => {
                if outcome.failure.is_none() && !outcome.exited_after_script {
                    debug!("Program outlived its script and was stopped");
                }
                (outcome.rounds, outcome.failure)
            }
            None => (Vec::new(), None),
        };

        let verdict = self.verdicts.build(Evidence {
            rounds,
            reason: teardown.reason,
            exit: teardown.exit.map_err(|e| e.to_string()),
            failure,
            monitor_breach: report.breach,
            driver_fault,
            stderr_tail: relay_output.stderr_tail,
            limits,
            elapsed: teardown.elapsed,
            peak_memory: gauge.peak(),
            started_at,
        });

        info!(
            verdict = %verdict.verdict,
            rounds = verdict.rounds.len(),
            elapsed_ms = verdict.elapsed_ms,
            peak_memory = verdict.peak_memory_bytes,
            samples = report.samples,
            breach = ?report.breach,
            stderr_bytes = relay_output.stderr_bytes,
            stderr_truncated = relay_output.stderr_truncated,
            "Execution finished"
        );
        verdict
    }
}
