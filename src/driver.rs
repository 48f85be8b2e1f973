//! Scripted round exchange with a sandboxed program.
//!
//! Each round writes `"<command> <argument>"` and waits for exactly one line.
//! The first round that fails ends the exchange; its result is recorded and
//! no later round is attempted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::monitor::MemoryGauge;
use crate::relay::{IoRelay, RelayError};
use crate::sandbox::{ResourceLimits, TerminationLatch, TerminationReason};

/// What a response line must look like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseShape {
    /// Any single line
    #[default]
    Any,
    /// A base-10 integer with an optional sign
    Integer,
    /// A finite decimal number
    Number,
    /// Exactly this text, ignoring surrounding whitespace
    Literal(String),
    /// At least one non-whitespace character
    NonEmpty,
}

impl ResponseShape {
    /// Check `line` against the shape, describing the mismatch on failure.
    pub fn check(&self, line: &str) -> Result<(), String> {
        let value = line.trim();
        let ok = match self {
            Self::Any => true,
            Self::Integer => is_integer(value),
            Self::Number => value.parse::<f64>().map(f64::is_finite).unwrap_or(false),
            Self::Literal(expected) => value == expected,
            Self::NonEmpty => !value.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(format!("expected {}, got {:?}", self, truncate(line, 64)))
        }
    }
}

impl fmt::Display for ResponseShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("a line"),
            Self::Integer => f.write_str("an integer"),
            Self::Number => f.write_str("a number"),
            Self::Literal(text) => write!(f, "{:?}", text),
            Self::NonEmpty => f.write_str("a non-empty line"),
        }
    }
}

fn is_integer(value: &str) -> bool {
    let digits = value.strip_prefix(&['-', '+'][..]).unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// One scripted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StepRepr")]
pub struct RoundStep {
    pub command: String,
    pub argument: String,
    pub expect: ResponseShape,
}

impl RoundStep {
    pub fn new(command: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            argument: argument.into(),
            expect: ResponseShape::Any,
        }
    }

    pub fn expecting(mut self, expect: ResponseShape) -> Self {
        self.expect = expect;
        self
    }

    /// The request line, without the trailing newline.
    pub fn request_line(&self) -> String {
        if self.argument.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.argument)
        }
    }
}

/// Steps are written either as `["cmd", "arg"]` or as full objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum StepRepr {
    Pair(String, String),
    Full {
        command: String,
        #[serde(default)]
        argument: String,
        #[serde(default)]
        expect: ResponseShape,
    },
}

impl From<StepRepr> for RoundStep {
    fn from(repr: StepRepr) -> Self {
        match repr {
            StepRepr::Pair(command, argument) => RoundStep::new(command, argument),
            StepRepr::Full {
                command,
                argument,
                expect,
            } => RoundStep {
                command,
                argument,
                expect,
            },
        }
    }
}

pub type RoundScript = Vec<RoundStep>;

/// What a round produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "output", rename_all = "camelCase")]
pub enum RoundOutput {
    Line(String),
    NoOutput,
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResult {
    pub index: usize,
    #[serde(flatten)]
    pub output: RoundOutput,
    pub elapsed_ms: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Sending,
    AwaitingResponse,
    RoundComplete,
    Finished,
}

/// Why the exchange ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverFailure {
    /// No response before the round deadline
    Timeout { round: usize, limit: Duration },
    /// The program closed its streams mid-script
    Closed { round: usize, detail: String },
    /// The response did not have the expected shape
    Protocol { round: usize, detail: String },
    /// A termination request interrupted the round
    Stopped { round: usize },
    /// The relay failed for reasons unrelated to the program
    Internal { round: usize, detail: String },
}

impl DriverFailure {
    pub fn round(&self) -> usize {
        match self {
            Self::Timeout { round, .. }
            | Self::Closed { round, .. }
            | Self::Protocol { round, .. }
            | Self::Stopped { round }
            | Self::Internal { round, .. } => *round,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub rounds: Vec<RoundResult>,
    pub failure: Option<DriverFailure>,
    pub state: DriverState,
    /// The program exited on its own after the last round
    pub exited_after_script: bool,
}

pub struct RoundDriver {
    script: RoundScript,
    time_limit: Duration,
    total_time_limit: Duration,
    exit_grace: Duration,
    state: DriverState,
}

impl RoundDriver {
    pub fn new(script: RoundScript, limits: &ResourceLimits, exit_grace: Duration) -> Self {
        Self {
            script,
            time_limit: limits.time_limit,
            total_time_limit: limits.total_time_limit,
            exit_grace,
            state: DriverState::Idle,
        }
    }

    /// Drive every round, stopping at the first failure.
    pub async fn run(
        mut self,
        relay: &mut IoRelay,
        latch: &TerminationLatch,
        started_at: Instant,
        gauge: Arc<MemoryGauge>,
    ) -> DriverOutcome {
        let total_deadline = started_at + self.total_time_limit;
        let script = std::mem::take(&mut self.script);
        let mut rounds = Vec::with_capacity(script.len());
        let mut failure = None;

        for (index, step) in script.iter().enumerate() {
            let round_start = Instant::now();
            let deadline = (round_start + self.time_limit).min(total_deadline);

            let result = self.round(relay, step, deadline).await;
            let elapsed_ms = round_start.elapsed().as_millis() as u64;

            let (output, round_failure) = match result {
                Ok(line) => match step.expect.check(&line) {
                    Ok(()) => (RoundOutput::Line(line), None),
                    Err(detail) => (
                        RoundOutput::Malformed(line),
                        Some(DriverFailure::Protocol {
                            round: index,
                            detail,
                        }),
                    ),
                },
                Err(e) => self.classify(index, e, latch),
            };

            debug!(round = index, elapsed_ms, output = ?output, "Round complete");
            rounds.push(RoundResult {
                index,
                output,
                elapsed_ms,
                memory_bytes: gauge.current(),
            });
            self.state = DriverState::RoundComplete;

            if let Some(f) = round_failure {
                info!(round = index, failure = ?f, "Exchange stopped");
                failure = Some(f);
                break;
            }
        }

        self.state = DriverState::Finished;

        let exited_after_script = if failure.is_none() {
            relay.close_stdin().await;
            let deadline = (Instant::now() + self.exit_grace).min(total_deadline);
            self.await_exit(latch, deadline).await
        } else {
            false
        };

        DriverOutcome {
            rounds,
            failure,
            state: self.state,
            exited_after_script,
        }
    }

    async fn round(
        &mut self,
        relay: &mut IoRelay,
        step: &RoundStep,
        deadline: Instant,
    ) -> Result<String, RelayError> {
        self.state = DriverState::Sending;
        // A program that never reads can fill the pipe and block the write
        match timeout_at(deadline, relay.write_line(&step.request_line())).await {
            Ok(result) => result?,
            Err(_) => return Err(RelayError::Timeout),
        }

        self.state = DriverState::AwaitingResponse;
        relay.read_line(deadline).await
    }

    fn classify(
        &self,
        round: usize,
        error: RelayError,
        latch: &TerminationLatch,
    ) -> (RoundOutput, Option<DriverFailure>) {
        match error {
            RelayError::Timeout => {
                latch.request(TerminationReason::TimeLimitExceeded);
                (
                    RoundOutput::NoOutput,
                    Some(DriverFailure::Timeout {
                        round,
                        limit: self.time_limit,
                    }),
                )
            }
            RelayError::Closed | RelayError::BrokenPipe => (
                RoundOutput::NoOutput,
                Some(DriverFailure::Closed {
                    round,
                    detail: error.to_string(),
                }),
            ),
            RelayError::Oversized { .. } | RelayError::InvalidUtf8 => (
                RoundOutput::Malformed(String::new()),
                Some(DriverFailure::Protocol {
                    round,
                    detail: error.to_string(),
                }),
            ),
            RelayError::Cancelled => (RoundOutput::NoOutput, Some(DriverFailure::Stopped { round })),
            RelayError::Io(detail) => {
                warn!(round, error = %detail, "Relay failed");
                latch.request(TerminationReason::HarnessFault);
                (
                    RoundOutput::NoOutput,
                    Some(DriverFailure::Internal { round, detail }),
                )
            }
        }
    }

    /// Give the program until `deadline` to exit on its own.
    async fn await_exit(&self, latch: &TerminationLatch, deadline: Instant) -> bool {
        let exited = latch.exited_token();
        let stop = latch.stop_token();
        tokio::select! {
            _ = exited.cancelled() => true,
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Program still running after the script");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RelayConfig;
    use crate::sandbox::SandboxStdio;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_response_shapes() {
        assert!(ResponseShape::Integer.check("-42").is_ok());
        assert!(ResponseShape::Integer.check(" 7 ").is_ok());
        assert!(ResponseShape::Integer.check("4.2").is_err());
        assert!(ResponseShape::Integer.check("-").is_err());
        assert!(ResponseShape::Number.check("4.2e3").is_ok());
        assert!(ResponseShape::Number.check("inf").is_err());
        assert!(ResponseShape::Literal("ok".into()).check("ok\r").is_ok());
        assert!(ResponseShape::Literal("ok".into()).check("OK").is_err());
        assert!(ResponseShape::NonEmpty.check("   ").is_err());
        assert!(ResponseShape::Any.check("").is_ok());
    }

    #[test]
    fn test_shape_error_names_the_expectation() {
        let err = ResponseShape::Integer.check("abc").unwrap_err();
        assert_eq!(err, "expected an integer, got \"abc\"");
    }

    #[test]
    fn test_step_forms() {
        let steps: RoundScript = serde_json::from_str(
            r#"[
                ["echo", "5"],
                {"command": "echo", "argument": "6", "expect": "integer"},
                {"command": "ping", "expect": {"literal": "pong"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(steps[0], RoundStep::new("echo", "5"));
        assert_eq!(steps[1].expect, ResponseShape::Integer);
        assert_eq!(steps[2].request_line(), "ping");
        assert_eq!(steps[2].expect, ResponseShape::Literal("pong".into()));
    }

    #[test]
    fn test_round_result_json() {
        let result = RoundResult {
            index: 0,
            output: RoundOutput::Line("5".into()),
            elapsed_ms: 3,
            memory_bytes: 1024,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "line");
        assert_eq!(json["output"], "5");
        assert_eq!(json["elapsedMs"], 3);

        let none = RoundResult {
            output: RoundOutput::NoOutput,
            ..result
        };
        let json = serde_json::to_value(&none).unwrap();
        assert_eq!(json["status"], "noOutput");
        assert!(json.get("output").is_none());
    }

    fn limits(time_ms: u64, total_ms: u64) -> ResourceLimits {
        ResourceLimits {
            time_limit: Duration::from_millis(time_ms),
            total_time_limit: Duration::from_millis(total_ms),
            memory_limit: 1 << 20,
        }
    }

    /// Relay wired to an in-process responder that answers each request
    /// with `respond(request)`, or stays silent when it returns `None`.
    fn responder(
        latch: &TerminationLatch,
        respond: impl Fn(&str) -> Option<String> + Send + 'static,
    ) -> IoRelay {
        let (stdin_ours, stdin_theirs) = duplex(4096);
        let (mut stdout_theirs, stdout_ours) = duplex(4096);
        let (_stderr_theirs, stderr_ours) = duplex(64);

        tokio::spawn(async move {
            let _stderr = _stderr_theirs;
            let mut lines = BufReader::new(stdin_theirs).lines();
            while let Ok(Some(request)) = lines.next_line().await {
                if let Some(reply) = respond(&request) {
                    stdout_theirs.write_all(reply.as_bytes()).await.unwrap();
                }
            }
        });

        IoRelay::attach(
            SandboxStdio {
                stdin: Box::new(stdin_ours),
                stdout: Box::new(stdout_ours),
                stderr: Box::new(stderr_ours),
            },
            latch.stop_token(),
            &RelayConfig::default(),
        )
    }

    fn echo(request: &str) -> Option<String> {
        let arg = request.split_once(' ').map(|(_, a)| a).unwrap_or("");
        Some(format!("{}\n", arg))
    }

    #[tokio::test]
    async fn test_all_rounds_complete() {
        let latch = TerminationLatch::new();
        let mut relay = responder(&latch, echo);
        let script = vec![RoundStep::new("echo", "1"), RoundStep::new("echo", "2")];

        let outcome = RoundDriver::new(script, &limits(500, 5_000), Duration::from_millis(10))
            .run(&mut relay, &latch, Instant::now(), Arc::new(MemoryGauge::new()))
            .await;

        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.state, DriverState::Finished);
        assert_eq!(
            outcome.rounds.iter().map(|r| r.output.clone()).collect::<Vec<_>>(),
            vec![RoundOutput::Line("1".into()), RoundOutput::Line("2".into())]
        );
        assert_eq!(latch.reason(), None);
    }

    #[tokio::test]
    async fn test_timeout_halts_at_that_round() {
        let latch = TerminationLatch::new();
        let mut relay = responder(&latch, |request| {
            (request != "echo 2").then(|| "ok\n".to_string())
        });
        let script = vec![
            RoundStep::new("echo", "1"),
            RoundStep::new("echo", "2"),
            RoundStep::new("echo", "3"),
        ];

        let outcome = RoundDriver::new(script, &limits(50, 5_000), Duration::from_millis(10))
            .run(&mut relay, &latch, Instant::now(), Arc::new(MemoryGauge::new()))
            .await;

        assert_eq!(outcome.rounds.len(), 2);
        assert_eq!(outcome.rounds[1].output, RoundOutput::NoOutput);
        assert!(matches!(
            outcome.failure,
            Some(DriverFailure::Timeout { round: 1, .. })
        ));
        assert_eq!(latch.reason(), Some(TerminationReason::TimeLimitExceeded));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let latch = TerminationLatch::new();
        let mut relay = responder(&latch, |_| Some("not a number\n".to_string()));
        let script = vec![RoundStep::new("echo", "1").expecting(ResponseShape::Integer)];

        let outcome = RoundDriver::new(script, &limits(500, 5_000), Duration::from_millis(10))
            .run(&mut relay, &latch, Instant::now(), Arc::new(MemoryGauge::new()))
            .await;

        assert_eq!(
            outcome.rounds[0].output,
            RoundOutput::Malformed("not a number".into())
        );
        assert!(matches!(
            outcome.failure,
            Some(DriverFailure::Protocol { round: 0, .. })
        ));
        assert_eq!(latch.reason(), None);
    }

    #[tokio::test]
    async fn test_closed_stream_is_not_a_timeout() {
        let latch = TerminationLatch::new();
        let (stdin_ours, _stdin_theirs) = duplex(4096);
        let (stdout_theirs, stdout_ours) = duplex(64);
        let (_stderr_theirs, stderr_ours) = duplex(64);
        drop(stdout_theirs);
        let mut relay = IoRelay::attach(
            SandboxStdio {
                stdin: Box::new(stdin_ours),
                stdout: Box::new(stdout_ours),
                stderr: Box::new(stderr_ours),
            },
            latch.stop_token(),
            &RelayConfig::default(),
        );

        let outcome = RoundDriver::new(
            vec![RoundStep::new("echo", "1"), RoundStep::new("echo", "2")],
            &limits(500, 5_000),
            Duration::from_millis(10),
        )
        .run(&mut relay, &latch, Instant::now(), Arc::new(MemoryGauge::new()))
        .await;

        assert_eq!(outcome.rounds.len(), 1);
        assert!(matches!(
            outcome.failure,
            Some(DriverFailure::Closed { round: 0, .. })
        ));
        assert_eq!(latch.reason(), None);
    }

    #[tokio::test]
    async fn test_stop_request_interrupts_round() {
        let latch = Arc::new(TerminationLatch::new());
        let mut relay = responder(&latch, |_| None);

        let stopper = latch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.request(TerminationReason::MemoryLimitExceeded);
        });

        let outcome = RoundDriver::new(
            vec![RoundStep::new("echo", "1")],
            &limits(5_000, 10_000),
            Duration::from_millis(10),
        )
        .run(&mut relay, &latch, Instant::now(), Arc::new(MemoryGauge::new()))
        .await;

        assert_eq!(outcome.failure, Some(DriverFailure::Stopped { round: 0 }));
        assert_eq!(outcome.rounds[0].output, RoundOutput::NoOutput);
        assert_eq!(latch.reason(), Some(TerminationReason::MemoryLimitExceeded));
    }
}
