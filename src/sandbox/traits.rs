use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::sandbox::spec::{RawExit, SandboxSpec};

/// Capability flags indicating what the backend supports
#[derive(Debug, Clone, Default)]
pub struct BackendCapabilities {
    /// The backend can tell an OOM kill apart from other signals
    pub oom_detection: bool,
    /// Supports networking inside the sandbox
    pub networking: bool,
}

/// Information about a running sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Backend type identifier
    pub backend_type: String,
    /// Instance identifier (PID, container name, etc.)
    pub instance_id: String,
    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// How hard to ask a sandbox to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM or equivalent
    Graceful,
    /// SIGKILL or equivalent
    Forced,
}

/// Standard streams of a launched sandbox.
pub struct SandboxStdio {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

/// A freshly launched sandbox: the live instance plus its streams.
pub struct Launched {
    pub instance: Arc<dyn SandboxInstance>,
    pub stdio: SandboxStdio,
}

/// Trait for sandbox execution backends.
///
/// A backend turns a `SandboxSpec` into a running, resource-capped process
/// (a container, a process group in a cgroup, ...). Backends are shared
/// between executions; each launch yields an independent instance.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Returns the backend name (e.g., "native", "docker")
    fn name(&self) -> &str;

    /// Returns the capabilities of this backend
    fn capabilities(&self) -> BackendCapabilities;

    /// Launch the program described by `spec` with its memory ceiling applied.
    ///
    /// Resources acquired before a failure must be released before returning.
    async fn launch(&self, spec: &SandboxSpec) -> Result<Launched>;

    /// Check if the backend is able to launch sandboxes right now.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// One live sandbox. All methods take `&self` so the reaper, the monitor and
/// the terminator can share an instance.
#[async_trait]
pub trait SandboxInstance: Send + Sync {
    /// Backend specific identifier (PID, container name)
    fn id(&self) -> &str;

    /// Get information about the sandbox instance
    fn info(&self) -> SandboxInfo;

    /// Current memory footprint in bytes, when it can be sampled
    async fn memory_usage(&self) -> Option<u64>;

    /// Deliver a stop signal. Signalling an exited sandbox is not an error.
    async fn signal(&self, signal: StopSignal) -> Result<()>;

    /// Wait for the sandboxed program to exit. Called once, by the reaper.
    async fn wait(&self) -> Result<RawExit>;

    /// Release every OS resource held by the instance (container, cgroup).
    async fn release(&self) -> Result<()>;

    /// Best-effort synchronous kill used when a handle is dropped without
    /// an orderly teardown.
    fn kill_now(&self);
}
