use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{JudgeletError, Result};
use crate::verdict::FailureSignal;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeletConfig {
    pub sandbox: SandboxConfig,
    pub limits: LimitDefaults,
    pub monitor: MonitorConfig,
    pub relay: RelayConfig,
    pub verdict: VerdictConfig,
}

impl JudgeletConfig {
    /// Reject values that would make an execution meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.sample_interval_ms == 0 {
            return Err(JudgeletError::Config(
                "monitor.sample_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.relay.max_line_bytes == 0 {
            return Err(JudgeletError::Config(
                "relay.max_line_bytes must be greater than zero".to_string(),
            ));
        }
        if self.sandbox.grace_period_ms == 0 {
            return Err(JudgeletError::Config(
                "sandbox.grace_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.limits.time_limit_ms > self.limits.total_time_limit_ms {
            return Err(JudgeletError::Config(format!(
                "limits.time_limit_ms ({}) exceeds limits.total_time_limit_ms ({})",
                self.limits.time_limit_ms, self.limits.total_time_limit_ms
            )));
        }
        self.verdict.validate()
    }
}

/// The type of sandbox backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Plain process group with kernel resource limits
    Native,
    /// Docker container sandbox
    Docker,
    /// Automatically select the best available backend
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Working directory used when a request does not name one
    pub default_workdir: Option<String>,
    /// Time between the graceful and the forced kill signal
    pub grace_period_ms: u64,
    /// Time a candidate gets to exit on its own after the last round
    pub exit_grace_ms: u64,
    /// Docker-specific configuration
    pub docker: DockerConfig,
    /// Native-specific configuration
    pub native: NativeConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            default_workdir: None,
            grace_period_ms: 200,
            exit_grace_ms: 1000,
            docker: DockerConfig::default(),
            native: NativeConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker CLI binary (resolved on PATH when relative)
    pub docker_binary: String,
    /// Enable networking in the container (default: false)
    pub enable_networking: bool,
    /// CPU quota in cores (0 = unlimited)
    pub cpus: f64,
    /// Maximum number of processes inside the container (0 = unlimited)
    pub pids_limit: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            enable_networking: false,
            cpus: 1.0,
            pids_limit: 64,
        }
    }
}

/// Native-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Delegated cgroup v2 directory under which one child group is created
    /// per execution. When unset, the harness's own group is used if the
    /// memory controller is delegated to it.
    pub cgroup_parent: Option<PathBuf>,
    /// Cap memory with RLIMIT_AS when no cgroup is usable. Allocations past
    /// the limit then fail inside the candidate, so breaches are not
    /// reported as MemoryLimitExceeded.
    pub rlimit_fallback: bool,
    /// Pass the harness PATH through to the candidate
    pub inherit_path: bool,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            cgroup_parent: None,
            rlimit_fallback: false,
            inherit_path: true,
        }
    }
}

/// Limits applied when an execution request leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitDefaults {
    pub time_limit_ms: u64,
    pub total_time_limit_ms: u64,
    pub memory_limit_bytes: u64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            time_limit_ms: 1000,
            total_time_limit_ms: 10_000,
            memory_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Memory sampling period
    pub sample_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 20,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bytes of stderr retained for diagnostics (tail only)
    pub stderr_tail_bytes: usize,
    /// Longest accepted response line
    pub max_line_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stderr_tail_bytes: 4096,
            max_line_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictConfig {
    /// Failure signals from strongest to weakest
    pub precedence: Vec<FailureSignal>,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            precedence: FailureSignal::DEFAULT_PRECEDENCE.to_vec(),
        }
    }
}

impl VerdictConfig {
    fn validate(&self) -> Result<()> {
        for signal in FailureSignal::DEFAULT_PRECEDENCE {
            let count = self.precedence.iter().filter(|s| **s == signal).count();
            if count != 1 {
                return Err(JudgeletError::Config(format!(
                    "verdict.precedence must list '{}' exactly once (found {})",
                    signal, count
                )));
            }
        }
        Ok(())
    }
}
