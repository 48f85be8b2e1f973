use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::types::MonitorConfig;
use crate::sandbox::{ResourceLimits, SandboxInstance, TerminationLatch, TerminationReason};

/// Latest and peak memory samples, shared between the monitor and the driver.
#[derive(Debug, Default)]
pub struct MemoryGauge {
    current: AtomicU64,
    peak: AtomicU64,
}

impl MemoryGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        self.current.store(bytes, Ordering::Relaxed);
        self.peak.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// What the monitor saw before it stopped.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    /// Breach this monitor requested, whether or not it won the latch
    pub breach: Option<TerminationReason>,
    pub samples: u64,
}

/// Samples memory and aggregate wall-clock time for one execution.
///
/// Breaches are reported through the handle's termination latch; the monitor
/// never signals the process itself.
pub struct LimitMonitor {
    sample_interval: Duration,
    memory_limit: u64,
    total_time_limit: Duration,
}

impl LimitMonitor {
    pub fn new(limits: &ResourceLimits, config: &MonitorConfig) -> Self {
        Self {
            sample_interval: config.sample_interval(),
            memory_limit: limits.memory_limit,
            total_time_limit: limits.total_time_limit,
        }
    }

    /// Run until the sandbox exits or a stop is requested.
    pub fn spawn(
        self,
        instance: Arc<dyn SandboxInstance>,
        latch: Arc<TerminationLatch>,
        started_at: Instant,
        gauge: Arc<MemoryGauge>,
    ) -> JoinHandle<MonitorReport> {
        tokio::spawn(async move { self.run(instance, latch, started_at, gauge).await })
    }

    async fn run(
        self,
        instance: Arc<dyn SandboxInstance>,
        latch: Arc<TerminationLatch>,
        started_at: Instant,
        gauge: Arc<MemoryGauge>,
    ) -> MonitorReport {
        let deadline = started_at + self.total_time_limit;
        let stop = latch.stop_token();
        let exited = latch.exited_token();

        let mut ticker = interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report = MonitorReport::default();

        loop {
            tokio::select! {
                biased;
                _ = exited.cancelled() => break,
                _ = stop.cancelled() => {
                    // Another component latched first; a breach seen now still counts
                    if self.sample(instance.as_ref(), &gauge, &mut report).await {
                        self.breach(&latch, TerminationReason::MemoryLimitExceeded, &gauge, &mut report);
                    }
                    break;
                }
                _ = sleep_until(deadline) => {
                    // A breach inside the last interval still counts as memory
                    let reason = if self.sample(instance.as_ref(), &gauge, &mut report).await {
                        TerminationReason::MemoryLimitExceeded
                    } else {
                        TerminationReason::TimeLimitExceeded
                    };
                    self.breach(&latch, reason, &gauge, &mut report);
                    break;
                }
                _ = ticker.tick() => {
                    if self.sample(instance.as_ref(), &gauge, &mut report).await {
                        self.breach(&latch, TerminationReason::MemoryLimitExceeded, &gauge, &mut report);
                        break;
                    }
                }
            }
        }

        debug!(
            samples = report.samples,
            peak_memory = gauge.peak(),
            "Limit monitor stopped"
        );
        report
    }

    /// Take one memory sample; true when it is over the limit.
    async fn sample(
        &self,
        instance: &dyn SandboxInstance,
        gauge: &MemoryGauge,
        report: &mut MonitorReport,
    ) -> bool {
        match instance.memory_usage().await {
            Some(bytes) => {
                report.samples += 1;
                gauge.record(bytes);
                bytes > self.memory_limit
            }
            None => false,
        }
    }

    fn breach(
        &self,
        latch: &TerminationLatch,
        reason: TerminationReason,
        gauge: &MemoryGauge,
        report: &mut MonitorReport,
    ) {
        report.breach = Some(reason);
        if latch.request(reason) {
            info!(
                reason = %reason,
                memory = gauge.current(),
                memory_limit = self.memory_limit,
                total_time_limit_ms = self.total_time_limit.as_millis() as u64,
                "Limit breached"
            );
        }
    }
}
