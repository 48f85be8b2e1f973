use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JudgeletError, Result};

/// Time and memory ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Deadline for a single round (write request, read response)
    pub time_limit: Duration,
    /// Wall-clock budget measured from sandbox start
    pub total_time_limit: Duration,
    /// Hard memory ceiling in bytes
    pub memory_limit: u64,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.time_limit.is_zero() || self.total_time_limit.is_zero() {
            return Err(JudgeletError::InvalidRequest(
                "time limits must be greater than zero".to_string(),
            ));
        }
        if self.memory_limit == 0 {
            return Err(JudgeletError::InvalidRequest(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Immutable description of what to run.
///
/// For the docker backend `program` is an image reference and `args` the
/// command inside the image; for the native backend `program` is an
/// executable path.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<String>,
    pub env_vars: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

/// Why the supervisor decided to stop a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TerminationReason {
    TimeLimitExceeded = 1,
    MemoryLimitExceeded = 2,
    /// Caller cancelled the execution
    Cancelled = 3,
    /// Harness-side fault unrelated to the candidate
    HarnessFault = 4,
}

impl TerminationReason {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::TimeLimitExceeded),
            2 => Some(Self::MemoryLimitExceeded),
            3 => Some(Self::Cancelled),
            4 => Some(Self::HarnessFault),
            _ => None,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TimeLimitExceeded => "time limit exceeded",
            Self::MemoryLimitExceeded => "memory limit exceeded",
            Self::Cancelled => "cancelled",
            Self::HarnessFault => "harness fault",
        };
        f.write_str(s)
    }
}

/// Raw exit status reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The kernel's OOM killer stopped the sandbox
    pub oom_killed: bool,
}

/// How the sandboxed program ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub oom_killed: bool,
    /// The supervisor sent the signal that ended the program
    pub supervisor_initiated: bool,
}

impl ExitInfo {
    pub fn from_raw(raw: RawExit, supervisor_initiated: bool) -> Self {
        Self {
            exit_code: raw.code,
            signal: raw.signal.map(signal_name),
            oom_killed: raw.oom_killed,
            supervisor_initiated,
        }
    }

    /// Exited by itself with status 0
    pub fn is_clean(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

/// Human readable name for a signal number (`SIGKILL`, `SIGSEGV`, ...).
pub fn signal_name(signal: i32) -> String {
    #[cfg(unix)]
    {
        if let Ok(sig) = nix::sys::signal::Signal::try_from(signal) {
            return sig.as_str().to_string();
        }
    }
    format!("SIG{}", signal)
}
