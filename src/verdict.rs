//! Aggregation of an execution's observations into one verdict.
//!
//! Several failure signals can be present at once (a program killed for
//! memory also stops answering). The builder collects every signal and
//! reports the first one in its precedence order.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::{DriverFailure, RoundResult};
use crate::sandbox::{ExitInfo, ResourceLimits, TerminationReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictKind {
    Completed,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    ProtocolViolation,
    InternalError,
}

impl VerdictKind {
    /// Two-letter code used in compact output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Completed => "OK",
            Self::TimeLimitExceeded => "TL",
            Self::MemoryLimitExceeded => "ML",
            Self::RuntimeError => "RE",
            Self::ProtocolViolation => "PV",
            Self::InternalError => "IE",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "Completed",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
            Self::ProtocolViolation => "Protocol Violation",
            Self::InternalError => "Internal Error",
        };
        f.write_str(s)
    }
}

/// A class of failure evidence, ranked by `verdict.precedence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSignal {
    /// OOM kill or latched memory breach
    Memory,
    /// Latched time breach or round timeout
    Time,
    /// Cancellation or harness fault
    Internal,
    /// Malformed response
    Protocol,
    /// Abnormal exit or streams closed mid-script
    Crash,
}

impl FailureSignal {
    pub const DEFAULT_PRECEDENCE: [FailureSignal; 5] = [
        FailureSignal::Memory,
        FailureSignal::Time,
        FailureSignal::Internal,
        FailureSignal::Protocol,
        FailureSignal::Crash,
    ];

    pub fn verdict(&self) -> VerdictKind {
        match self {
            Self::Memory => VerdictKind::MemoryLimitExceeded,
            Self::Time => VerdictKind::TimeLimitExceeded,
            Self::Internal => VerdictKind::InternalError,
            Self::Protocol => VerdictKind::ProtocolViolation,
            Self::Crash => VerdictKind::RuntimeError,
        }
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Memory => "memory",
            Self::Time => "time",
            Self::Internal => "internal",
            Self::Protocol => "protocol",
            Self::Crash => "crash",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub verdict: VerdictKind,
    pub detail: String,
    pub rounds: Vec<RoundResult>,
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub elapsed_ms: u64,
    pub peak_memory_bytes: u64,
    pub started_at: DateTime<Utc>,
}

impl Verdict {
    /// Verdict for an execution whose sandbox could not be started.
    pub fn launch_failure(message: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            verdict: VerdictKind::InternalError,
            detail: message.to_string(),
            rounds: Vec::new(),
            stderr_tail: String::new(),
            exit_code: None,
            signal: None,
            elapsed_ms: 0,
            peak_memory_bytes: 0,
            started_at,
        }
    }
}

/// Everything observed about one execution.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub rounds: Vec<RoundResult>,
    pub reason: Option<TerminationReason>,
    /// `Err` carries why the exit could not be observed
    pub exit: Result<ExitInfo, String>,
    pub failure: Option<DriverFailure>,
    /// Breach the limit monitor saw, whether or not it won the latch
    pub monitor_breach: Option<TerminationReason>,
    /// Set when the driver task itself failed
    pub driver_fault: Option<String>,
    pub stderr_tail: String,
    pub limits: ResourceLimits,
    pub elapsed: Duration,
    pub peak_memory: u64,
    pub started_at: DateTime<Utc>,
}

pub struct VerdictBuilder {
    precedence: Vec<FailureSignal>,
}

impl Default for VerdictBuilder {
    fn default() -> Self {
        Self::new(FailureSignal::DEFAULT_PRECEDENCE.to_vec())
    }
}

impl VerdictBuilder {
    pub fn new(precedence: Vec<FailureSignal>) -> Self {
        Self { precedence }
    }

    pub fn build(&self, evidence: Evidence) -> Verdict {
        let signal = self
            .precedence
            .iter()
            .copied()
            .find(|signal| present(*signal, &evidence));

        let (verdict, detail) = match signal {
            Some(signal) => (signal.verdict(), describe(signal, &evidence)),
            None => (
                VerdictKind::Completed,
                format!("{} rounds completed", evidence.rounds.len()),
            ),
        };

        let (exit_code, exit_signal) = match &evidence.exit {
            Ok(exit) => (exit.exit_code, exit.signal.clone()),
            Err(_) => (None, None),
        };

        Verdict {
            verdict,
            detail,
            rounds: evidence.rounds,
            stderr_tail: evidence.stderr_tail,
            exit_code,
            signal: exit_signal,
            elapsed_ms: evidence.elapsed.as_millis() as u64,
            peak_memory_bytes: evidence.peak_memory,
            started_at: evidence.started_at,
        }
    }
}

fn present(signal: FailureSignal, evidence: &Evidence) -> bool {
    let reason = evidence.reason;
    match signal {
        FailureSignal::Memory => {
            reason == Some(TerminationReason::MemoryLimitExceeded)
                || evidence.monitor_breach == Some(TerminationReason::MemoryLimitExceeded)
                || evidence.peak_memory > evidence.limits.memory_limit
                || matches!(&evidence.exit, Ok(exit) if exit.oom_killed)
        }
        FailureSignal::Time => {
            reason == Some(TerminationReason::TimeLimitExceeded)
                || matches!(evidence.failure, Some(DriverFailure::Timeout { .. }))
        }
        FailureSignal::Internal => {
            matches!(
                reason,
                Some(TerminationReason::Cancelled | TerminationReason::HarnessFault)
            ) || evidence.exit.is_err()
                || evidence.driver_fault.is_some()
                || matches!(evidence.failure, Some(DriverFailure::Internal { .. }))
                // Interrupted with no reason on record
                || (matches!(evidence.failure, Some(DriverFailure::Stopped { .. }))
                    && reason.is_none())
        }
        FailureSignal::Protocol => {
            matches!(evidence.failure, Some(DriverFailure::Protocol { .. }))
        }
        FailureSignal::Crash => {
            matches!(evidence.failure, Some(DriverFailure::Closed { .. }))
                || matches!(&evidence.exit, Ok(exit) if !exit.is_clean() && !exit.supervisor_initiated)
        }
    }
}

fn describe(signal: FailureSignal, evidence: &Evidence) -> String {
    let limits = &evidence.limits;
    match signal {
        FailureSignal::Memory => {
            let how = match &evidence.exit {
                Ok(exit) if exit.oom_killed => "killed by the OOM killer",
                _ => "memory limit breached",
            };
            format!(
                "{} (limit {} bytes, peak sample {} bytes)",
                how, limits.memory_limit, evidence.peak_memory
            )
        }
        FailureSignal::Time => match &evidence.failure {
            Some(DriverFailure::Timeout { round, limit }) => format!(
                "round {} produced no response within {} ms",
                round,
                limit.as_millis()
            ),
            _ => format!(
                "total time limit of {} ms exceeded",
                limits.total_time_limit.as_millis()
            ),
        },
        FailureSignal::Internal => {
            if let Some(fault) = &evidence.driver_fault {
                format!("harness fault: {}", fault)
            } else if let Err(e) = &evidence.exit {
                format!("sandbox exit could not be observed: {}", e)
            } else if let Some(DriverFailure::Internal { detail, .. }) = &evidence.failure {
                format!("harness fault: {}", detail)
            } else if evidence.reason == Some(TerminationReason::Cancelled) {
                "execution cancelled".to_string()
            } else {
                "execution stopped by the harness".to_string()
            }
        }
        FailureSignal::Protocol => match &evidence.failure {
            Some(DriverFailure::Protocol { round, detail }) => {
                format!("round {}: {}", round, detail)
            }
            _ => "protocol violation".to_string(),
        },
        FailureSignal::Crash => {
            let exit = match &evidence.exit {
                Ok(exit) => describe_exit(exit),
                Err(_) => None,
            };
            match (&evidence.failure, exit) {
                (Some(DriverFailure::Closed { round, .. }), Some(exit)) => {
                    format!("{} during round {}", exit, round)
                }
                (Some(DriverFailure::Closed { round, detail }), None) => {
                    format!("round {}: {}", round, detail)
                }
                (_, Some(exit)) => exit,
                (_, None) => "abnormal termination".to_string(),
            }
        }
    }
}

fn describe_exit(exit: &ExitInfo) -> Option<String> {
    if let Some(signal) = &exit.signal {
        return Some(format!("killed by {}", signal));
    }
    match exit.exit_code {
        Some(0) => None,
        Some(code) => Some(format!("exited with code {}", code)),
        None => None,
    }
}
