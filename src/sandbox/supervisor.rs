use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{JudgeletError, Result};
use crate::sandbox::latch::TerminationLatch;
use crate::sandbox::spec::{ExitInfo, RawExit, SandboxSpec, TerminationReason};
use crate::sandbox::traits::{SandboxBackend, SandboxInstance, SandboxStdio, StopSignal};

/// Exit observed by the reaper task.
#[derive(Debug, Clone)]
enum ExitState {
    Exited(RawExit),
    Failed(String),
}

/// Result of tearing a sandbox down.
#[derive(Debug)]
pub struct Teardown {
    /// How the program ended, or why the harness could not tell
    pub exit: Result<ExitInfo>,
    /// Termination reason latched during the execution
    pub reason: Option<TerminationReason>,
    /// Time from start until teardown completed
    pub elapsed: Duration,
}

/// Owns the lifecycle of sandboxed executions: start, signal, wait, release.
pub struct Supervisor {
    backend: Arc<dyn SandboxBackend>,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn SandboxBackend>, grace_period: Duration) -> Self {
        Self {
            backend,
            grace_period,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Launch a sandbox and attach the reaper and terminator tasks.
    pub async fn start(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        spec.limits.validate()?;

        info!(
            backend = self.backend.name(),
            program = %spec.program,
            memory_limit = spec.limits.memory_limit,
            "Starting sandbox"
        );

        let launched = self.backend.launch(spec).await?;
        let started_at = Instant::now();
        let instance = launched.instance;
        let id = instance.id().to_string();

        let latch = Arc::new(TerminationLatch::new());
        let signalled = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        let reaper = {
            let instance = instance.clone();
            let latch = latch.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let state = match instance.wait().await {
                    Ok(raw) => {
                        debug!(id = %id, code = ?raw.code, signal = ?raw.signal, "Sandbox exited");
                        ExitState::Exited(raw)
                    }
                    Err(e) => {
                        error!(id = %id, error = %e, "Failed to wait for sandbox");
                        ExitState::Failed(e.to_string())
                    }
                };
                exit_tx.send_replace(Some(state));
                latch.mark_exited();
            })
        };

        let terminator = {
            let instance = instance.clone();
            let stop = latch.stop_token();
            let exited = latch.exited_token();
            let signalled = signalled.clone();
            let grace = self.grace_period;
            tokio::spawn(async move {
                tokio::select! {
                    _ = exited.cancelled() => {}
                    _ = stop.cancelled() => {
                        escalate(instance.as_ref(), grace, &exited, &signalled).await;
                    }
                }
            })
        };

        info!(id = %id, "Sandbox started");

        Ok(SandboxHandle {
            id,
            instance,
            started_at,
            latch,
            signalled,
            exit_rx,
            stdio: Some(launched.stdio),
            reaper: Some(reaper),
            terminator: Some(terminator),
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Latch `reason` and stop the sandbox, returning once it is reaped.
    ///
    /// Safe to call repeatedly and concurrently with `wait`: only the first
    /// reason is kept and a single signal escalation runs.
    pub async fn terminate(&self, handle: &SandboxHandle, reason: TerminationReason) {
        if handle.latch.request(reason) {
            info!(id = %handle.id, reason = %reason, "Terminating sandbox");
        }
        if let Err(e) = handle.wait().await {
            warn!(id = %handle.id, error = %e, "Sandbox exit could not be observed");
        }
    }

    /// Wait for the sandbox to exit.
    pub async fn wait(&self, handle: &SandboxHandle) -> Result<ExitInfo> {
        handle.wait().await
    }

    /// Stop the sandbox if it is still running, then release its resources.
    ///
    /// Consumes the handle; release happens exactly once.
    pub async fn teardown(&self, mut handle: SandboxHandle) -> Teardown {
        if !handle.latch.has_exited() {
            debug!(id = %handle.id, "Sandbox still running at teardown");
            handle.latch.stop_quietly();
        }

        let exit = handle.wait().await;

        if let Some(task) = handle.reaper.take() {
            let _ = task.await;
        }
        if let Some(task) = handle.terminator.take() {
            let _ = task.await;
        }

        if let Err(e) = handle.release().await {
            error!(id = %handle.id, error = %e, "Failed to release sandbox resources");
        }

        let teardown = Teardown {
            exit,
            reason: handle.latch.reason(),
            elapsed: handle.started_at.elapsed(),
        };
        info!(
            id = %handle.id,
            reason = ?teardown.reason,
            elapsed_ms = teardown.elapsed.as_millis() as u64,
            "Sandbox torn down"
        );
        teardown
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL until the reaper reports exit.
async fn escalate(
    instance: &dyn SandboxInstance,
    grace: Duration,
    exited: &CancellationToken,
    signalled: &AtomicBool,
) {
    if exited.is_cancelled() {
        return;
    }
    signalled.store(true, Ordering::SeqCst);

    if let Err(e) = instance.signal(StopSignal::Graceful).await {
        warn!(id = instance.id(), error = %e, "Graceful stop failed");
    }
    if timeout(grace, exited.cancelled()).await.is_ok() {
        return;
    }

    loop {
        debug!(id = instance.id(), "Grace period elapsed, killing sandbox");
        if let Err(e) = instance.signal(StopSignal::Forced).await {
            warn!(id = instance.id(), error = %e, "Forced stop failed");
        }
        if timeout(grace, exited.cancelled()).await.is_ok() {
            return;
        }
    }
}

/// Live sandbox owned by the supervisor.
///
/// Other components get read-only views: the latch (to request
/// termination) and the instance (to sample memory). Dropping a handle that
/// was never torn down kills and releases the sandbox.
pub struct SandboxHandle {
    id: String,
    instance: Arc<dyn SandboxInstance>,
    started_at: Instant,
    latch: Arc<TerminationLatch>,
    signalled: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitState>>,
    stdio: Option<SandboxStdio>,
    reaper: Option<JoinHandle<()>>,
    terminator: Option<JoinHandle<()>>,
    released: Arc<AtomicBool>,
}

impl SandboxHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn latch(&self) -> Arc<TerminationLatch> {
        self.latch.clone()
    }

    /// Instance view used for memory sampling.
    pub fn instance(&self) -> Arc<dyn SandboxInstance> {
        self.instance.clone()
    }

    /// Hand the standard streams to the relay. Yields them once.
    pub fn take_stdio(&mut self) -> Option<SandboxStdio> {
        self.stdio.take()
    }

    async fn wait(&self) -> Result<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let state = rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| JudgeletError::Teardown("reaper task ended without an exit".to_string()))?
            .clone();

        match state {
            Some(ExitState::Exited(raw)) => Ok(ExitInfo::from_raw(
                raw,
                self.signalled.load(Ordering::SeqCst),
            )),
            Some(ExitState::Failed(message)) => Err(JudgeletError::Teardown(message)),
            None => Err(JudgeletError::Teardown("sandbox exit unknown".to_string())),
        }
    }

    async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.instance.release().await
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(id = %self.id, "Sandbox handle dropped without teardown, killing");
        self.latch.stop_quietly();
        self.instance.kill_now();

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let instance = self.instance.clone();
            let exited = self.latch.exited_token();
            let grace = Duration::from_secs(5);
            runtime.spawn(async move {
                let _ = timeout(grace, exited.cancelled()).await;
                if let Err(e) = instance.release().await {
                    error!(id = instance.id(), error = %e, "Failed to release dropped sandbox");
                }
            });
        }
    }
}
