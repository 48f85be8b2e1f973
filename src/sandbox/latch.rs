use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sandbox::spec::TerminationReason;

const NO_REASON: u8 = 0;

/// Single decision point for stopping a sandbox.
///
/// The first `request` wins the reason slot; every request fires the stop
/// token, which wakes the supervisor's terminator task and any pending
/// relay read. Once the sandbox has exited, requests are ignored.
#[derive(Debug, Default)]
pub struct TerminationLatch {
    reason: AtomicU8,
    stop: CancellationToken,
    exited: CancellationToken,
}

impl TerminationLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for termination. Returns `true` when this call latched the reason.
    pub fn request(&self, reason: TerminationReason) -> bool {
        if self.exited.is_cancelled() {
            return false;
        }

        let won = self
            .reason
            .compare_exchange(NO_REASON, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            debug!(reason = %reason, "Termination reason latched");
        }
        self.stop.cancel();
        won
    }

    /// Stop the sandbox without attributing a reason (teardown of a
    /// candidate that outlived its script).
    pub(crate) fn stop_quietly(&self) {
        self.stop.cancel();
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.cancel();
    }

    /// The latched reason, if any.
    pub fn reason(&self) -> Option<TerminationReason> {
        TerminationReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Fires on the first termination request.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Fires once the sandboxed process has been reaped.
    pub fn exited_token(&self) -> CancellationToken {
        self.exited.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_writer_wins() {
        let latch = TerminationLatch::new();
        assert!(latch.request(TerminationReason::MemoryLimitExceeded));
        assert!(!latch.request(TerminationReason::TimeLimitExceeded));
        assert_eq!(latch.reason(), Some(TerminationReason::MemoryLimitExceeded));
        assert!(latch.is_stopping());
    }

    #[test]
    fn test_requests_after_exit_are_ignored() {
        let latch = TerminationLatch::new();
        latch.mark_exited();
        assert!(!latch.request(TerminationReason::TimeLimitExceeded));
        assert_eq!(latch.reason(), None);
        assert!(!latch.is_stopping());
    }

    #[test]
    fn test_quiet_stop_records_no_reason() {
        let latch = TerminationLatch::new();
        latch.stop_quietly();
        assert!(latch.is_stopping());
        assert_eq!(latch.reason(), None);
        assert!(latch.request(TerminationReason::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_requests_latch_exactly_once() {
        let latch = Arc::new(TerminationLatch::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let latch = latch.clone();
            let reason = if i % 2 == 0 {
                TerminationReason::TimeLimitExceeded
            } else {
                TerminationReason::MemoryLimitExceeded
            };
            tasks.push(tokio::spawn(async move { latch.request(reason) }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(latch.reason().is_some());
    }
}
