//! Harness behavior against the scripted in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{fast_config, Fault, Reply, ScriptedBackend};
use judgelet::driver::{RoundOutput, RoundStep};
use judgelet::harness::{ExecutionRequest, Harness};
use judgelet::verdict::VerdictKind;

fn request(steps: Vec<RoundStep>) -> ExecutionRequest {
    ExecutionRequest {
        program: "candidate".to_string(),
        args: Vec::new(),
        workdir: None,
        env: Default::default(),
        round_script: steps,
        time_limit_per_round: None,
        total_time_limit: None,
        memory_limit: None,
    }
}

fn echo_steps(n: usize) -> Vec<RoundStep> {
    (1..=n)
        .map(|i| RoundStep::new("echo", i.to_string()))
        .collect()
}

#[tokio::test]
async fn test_completed_run_records_every_round() {
    let backend = ScriptedBackend::echo();
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(echo_steps(5)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::Completed);
    assert_eq!(verdict.rounds.len(), 5);
    for (i, round) in verdict.rounds.iter().enumerate() {
        assert_eq!(round.index, i);
        assert_eq!(round.output, RoundOutput::Line((i + 1).to_string()));
    }
    assert_eq!(verdict.exit_code, Some(0));
    assert_eq!(stats.releases(), 1);
}

#[tokio::test]
async fn test_silent_round_is_time_limit_exceeded() {
    let backend = ScriptedBackend::new(|request| {
        if request == "echo 3" {
            Reply::Silent
        } else {
            Reply::Line("ok".to_string())
        }
    });
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(echo_steps(5)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::TimeLimitExceeded);
    assert_eq!(verdict.rounds.len(), 3);
    assert_eq!(verdict.rounds[2].output, RoundOutput::NoOutput);
    assert_eq!(verdict.signal.as_deref(), Some("SIGTERM"));
    assert_eq!(stats.releases(), 1);
}

#[tokio::test]
async fn test_sigterm_ignored_escalates_to_sigkill() {
    let backend = ScriptedBackend::new(|_| Reply::Silent).ignoring_sigterm();
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(echo_steps(1)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::TimeLimitExceeded);
    assert_eq!(verdict.signal.as_deref(), Some("SIGKILL"));
    assert_eq!(stats.graceful_signals.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(stats.forced_signals.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_malformed_response_is_protocol_violation() {
    let backend = ScriptedBackend::new(|_| Reply::Line("five".to_string()));
    let harness = Harness::new(Arc::new(backend), fast_config());

    let steps = vec![RoundStep::new("echo", "5").expecting(judgelet::driver::ResponseShape::Integer)];
    let verdict = harness.execute(request(steps), CancellationToken::new()).await;

    assert_eq!(verdict.verdict, VerdictKind::ProtocolViolation);
    assert_eq!(verdict.rounds[0].output, RoundOutput::Malformed("five".into()));
}

#[tokio::test]
async fn test_oversized_response_is_protocol_violation() {
    let backend = ScriptedBackend::new(|_| Reply::Raw(vec![b'x'; 512]));
    let mut config = fast_config();
    config.relay.max_line_bytes = 64;
    let harness = Harness::new(Arc::new(backend), config);

    let verdict = harness
        .execute(request(echo_steps(1)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::ProtocolViolation);
}

#[tokio::test]
async fn test_crash_mid_script_is_runtime_error() {
    let backend = ScriptedBackend::new(|request| match request {
        "echo 2" => Reply::Exit(3),
        _ => Reply::Line("ok".to_string()),
    });
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(echo_steps(4)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::RuntimeError);
    assert_eq!(verdict.exit_code, Some(3));
    assert_eq!(verdict.rounds.len(), 2);
    assert_eq!(verdict.rounds[1].output, RoundOutput::NoOutput);
}

#[tokio::test]
async fn test_kernel_oom_kill_is_memory_limit_exceeded() {
    let backend = ScriptedBackend::new(|_| Reply::OomKill);
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(echo_steps(2)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::MemoryLimitExceeded);
    assert_eq!(verdict.signal.as_deref(), Some("SIGKILL"));
}

#[tokio::test]
async fn test_sampled_memory_breach_wins_over_time() {
    // Silent program over its memory ceiling: both limits are in play
    let backend = ScriptedBackend::new(|_| Reply::Silent).with_memory(64 * 1024 * 1024);
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let mut req = request(echo_steps(1));
    req.memory_limit = Some(32 * 1024 * 1024);
    let verdict = harness.execute(req, CancellationToken::new()).await;

    assert_eq!(verdict.verdict, VerdictKind::MemoryLimitExceeded);
    assert_eq!(verdict.peak_memory_bytes, 64 * 1024 * 1024);
    assert_eq!(stats.releases(), 1);
}

#[tokio::test]
async fn test_memory_growth_after_round_timeout_is_memory_limit_exceeded() {
    // The round deadline latches time first; the ticker has not sampled the growth yet
    let backend = ScriptedBackend::new(|_| Reply::Silent)
        .with_memory_after(Duration::from_millis(50), 512 * 1024 * 1024);
    let mut config = fast_config();
    config.monitor.sample_interval_ms = 1_000;
    let harness = Harness::new(Arc::new(backend), config);

    let mut req = request(echo_steps(1));
    req.time_limit_per_round = Some(200);
    req.total_time_limit = Some(5_000);
    req.memory_limit = Some(64 * 1024 * 1024);
    let verdict = harness.execute(req, CancellationToken::new()).await;

    assert_eq!(verdict.verdict, VerdictKind::MemoryLimitExceeded, "{}", verdict.detail);
    assert_eq!(verdict.peak_memory_bytes, 512 * 1024 * 1024);
}

#[tokio::test]
async fn test_total_time_limit() {
    let backend = ScriptedBackend::new(|_| Reply::Silent);
    let harness = Harness::new(Arc::new(backend), fast_config());

    let mut req = request(echo_steps(1));
    req.time_limit_per_round = Some(5_000);
    req.total_time_limit = Some(100);
    let verdict = harness.execute(req, CancellationToken::new()).await;

    assert_eq!(verdict.verdict, VerdictKind::TimeLimitExceeded);
    assert!(verdict.elapsed_ms < 2_000);
}

#[tokio::test]
async fn test_cancellation_yields_internal_error() {
    let backend = ScriptedBackend::new(|_| Reply::Silent);
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let mut req = request(echo_steps(1));
    req.time_limit_per_round = Some(5_000);
    let verdict = harness.execute(req, cancel).await;

    assert_eq!(verdict.verdict, VerdictKind::InternalError);
    assert_eq!(verdict.detail, "execution cancelled");
    assert_eq!(stats.releases(), 1);
}

#[tokio::test]
async fn test_stderr_tail_is_captured() {
    let backend = ScriptedBackend::new(|request| match request {
        "echo 1" => Reply::Stderr("std::invalid_argument: stoi\n".to_string()),
        _ => Reply::Line("ok".to_string()),
    });
    let harness = Harness::new(Arc::new(backend), fast_config());

    // The stderr write answers nothing, so the round times out
    let verdict = harness
        .execute(request(echo_steps(1)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::TimeLimitExceeded);
    assert_eq!(verdict.stderr_tail, "std::invalid_argument: stoi\n");
}

#[tokio::test]
async fn test_empty_script_completes() {
    let backend = ScriptedBackend::echo();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(Vec::new()), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::Completed);
    assert!(verdict.rounds.is_empty());
}

#[tokio::test]
async fn test_invalid_request_never_launches() {
    let backend = ScriptedBackend::echo();
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let mut req = request(echo_steps(1));
    req.program = String::new();
    let verdict = harness.execute(req, CancellationToken::new()).await;

    assert_eq!(verdict.verdict, VerdictKind::InternalError);
    assert!(verdict.detail.starts_with("Invalid execution request"));
    assert_eq!(stats.launches.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_launch_fault() {
    let backend = ScriptedBackend::echo().with_fault(Fault::Launch);
    let stats = backend.stats.clone();
    let harness = Harness::new(Arc::new(backend), fast_config());

    let verdict = harness
        .execute(request(echo_steps(2)), CancellationToken::new())
        .await;

    assert_eq!(verdict.verdict, VerdictKind::InternalError);
    assert_eq!(
        verdict.detail,
        "Sandbox launch failed: injected launch fault"
    );
    assert_eq!(stats.releases(), 0);
}

#[tokio::test]
async fn test_faults_release_exactly_once() {
    for fault in [Fault::Write, Fault::Read, Fault::Wait, Fault::Release] {
        let backend = ScriptedBackend::echo().with_fault(fault);
        let stats = backend.stats.clone();
        let harness = Harness::new(Arc::new(backend), fast_config());

        let verdict = harness
            .execute(request(echo_steps(3)), CancellationToken::new())
            .await;

        assert_eq!(stats.releases(), 1, "fault {:?}", fault);
        let expected = match fault {
            // A failed release is logged; the verdict stands
            Fault::Release => VerdictKind::Completed,
            _ => VerdictKind::InternalError,
        };
        assert_eq!(verdict.verdict, expected, "fault {:?}", fault);
    }
}
