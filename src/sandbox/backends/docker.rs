use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::types::DockerConfig;
use crate::error::{JudgeletError, Result};
use crate::sandbox::backends::procfs;
use crate::sandbox::spec::{RawExit, SandboxSpec};
use crate::sandbox::traits::{
    BackendCapabilities, Launched, SandboxBackend, SandboxInfo, SandboxInstance, SandboxStdio,
    StopSignal,
};

/// Exit status the docker CLI reports for a SIGKILLed container
const EXIT_SIGKILL: i32 = 137;

/// Docker sandbox backend.
///
/// Each execution runs in a fresh container attached with `docker run -i`:
/// the CLI relays the container's standard streams, the memory ceiling is
/// enforced by the container's cgroup (`--memory`, swap disabled), and the
/// container is inspected after exit to learn whether the OOM killer ended it.
/// The image must already exist locally.
pub struct DockerBackend {
    docker: PathBuf,
    enable_networking: bool,
    cpus: f64,
    pids_limit: u32,
    default_workdir: Option<String>,
}

impl DockerBackend {
    /// Create a new Docker backend.
    pub fn new(config: DockerConfig, default_workdir: Option<String>) -> Result<Self> {
        let docker = which::which(&config.docker_binary).map_err(|e| {
            JudgeletError::BackendNotAvailable {
                backend: "docker".to_string(),
                reason: format!("'{}' not found: {}", config.docker_binary, e),
            }
        })?;

        // Verify Docker is available
        if !Self::daemon_responds(&docker) {
            return Err(JudgeletError::BackendNotAvailable {
                backend: "docker".to_string(),
                reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                    .to_string(),
            });
        }

        info!(docker = %docker.display(), "Docker backend initialized");

        Ok(Self {
            docker,
            enable_networking: config.enable_networking,
            cpus: config.cpus,
            pids_limit: config.pids_limit,
            default_workdir,
        })
    }

    /// Check if the Docker backend is available on this system.
    ///
    /// Returns true if Docker daemon is accessible.
    pub fn is_available() -> bool {
        match which::which("docker") {
            Ok(docker) => Self::daemon_responds(&docker),
            Err(_) => false,
        }
    }

    fn daemon_responds(docker: &Path) -> bool {
        match std::process::Command::new(docker)
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    /// Check if a Docker image exists locally.
    async fn image_exists(&self, image: &str) -> bool {
        match Command::new(&self.docker)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn run_args(&self, name: &str, spec: &SandboxSpec) -> Vec<String> {
        let memory = spec.limits.memory_limit;
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            format!("--name={}", name),
            format!("--memory={}b", memory),
            // Equal to --memory: no swap on top of the ceiling
            format!("--memory-swap={}b", memory),
            "--restart=no".to_string(),
            "--log-driver=none".to_string(),
            "--stop-timeout=1".to_string(),
        ];

        // Network isolation
        if !self.enable_networking {
            args.push("--network=none".to_string());
        }
        if self.cpus > 0.0 {
            args.push(format!("--cpus={}", self.cpus));
        }
        if self.pids_limit > 0 {
            args.push(format!("--pids-limit={}", self.pids_limit));
        }

        // Environment variables
        for (key, value) in &spec.env_vars {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Working directory
        if let Some(dir) = spec.workdir.as_ref().or(self.default_workdir.as_ref()) {
            args.push("-w".to_string());
            args.push(dir.clone());
        }

        // Image and command
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            oom_detection: true,
            networking: self.enable_networking,
        }
    }

    async fn launch(&self, spec: &SandboxSpec) -> Result<Launched> {
        if !self.image_exists(&spec.program).await {
            return Err(JudgeletError::Launch(format!(
                "Docker image '{}' not found locally",
                spec.program
            )));
        }

        let name = format!("judgelet-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = Command::new(&self.docker);
        cmd.args(self.run_args(&name, spec));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(name = %name, image = %spec.program, "Starting container");

        let mut child = cmd.spawn().map_err(|e| {
            JudgeletError::Launch(format!("Failed to execute docker run: {}", e))
        })?;

        let instance = DockerInstance {
            docker: self.docker.clone(),
            name: name.clone(),
            image: spec.program.clone(),
            cli_pid: child.id(),
            host_pid: OnceCell::new(),
            killed: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
            child: Mutex::new(None),
        };

        let stdio = match take_stdio(&mut child) {
            Ok(stdio) => stdio,
            Err(e) => {
                // The CLI may already have created the container
                let _ = child.start_kill();
                instance.remove_container().await;
                return Err(e);
            }
        };
        *instance.child.lock().await = Some(child);

        info!(name = %name, "Container started");

        Ok(Launched {
            instance: Arc::new(instance),
            stdio,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(Self::daemon_responds(&self.docker))
    }
}

fn take_stdio(child: &mut Child) -> Result<SandboxStdio> {
    let missing = |stream: &str| {
        JudgeletError::Launch(format!("docker run {} was not captured", stream))
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    Ok(SandboxStdio {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
    })
}

struct DockerInstance {
    docker: PathBuf,
    name: String,
    image: String,
    /// PID of the attached `docker run` client
    cli_pid: Option<u32>,
    /// PID of the container's init process, resolved lazily
    host_pid: OnceCell<u32>,
    killed: AtomicBool,
    reaped: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl DockerInstance {
    async fn docker_output(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(JudgeletError::from)
    }

    async fn resolve_host_pid(&self) -> Option<u32> {
        if let Some(pid) = self.host_pid.get() {
            return Some(*pid);
        }
        let output = self
            .docker_output(&["inspect", "-f", "{{.State.Pid}}", &self.name])
            .await
            .ok()?;
        let pid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        // Zero until the container is running
        if pid == 0 {
            return None;
        }
        let _ = self.host_pid.set(pid);
        Some(pid)
    }

    /// `(oom_killed, exit_code)` as recorded by the daemon.
    async fn inspect_state(&self) -> Option<(bool, i32)> {
        let output = self
            .docker_output(&["inspect", "-f", "{{.State.OOMKilled}} {{.State.ExitCode}}", &self.name])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_state(&String::from_utf8_lossy(&output.stdout))
    }

    async fn remove_container(&self) {
        match self.docker_output(&["rm", "-f", &self.name]).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    warn!(name = %self.name, error = %stderr.trim(), "Failed to remove container");
                }
            }
            Err(e) => warn!(name = %self.name, error = %e, "Failed to run docker rm"),
        }
    }

    #[cfg(unix)]
    fn kill_cli(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.cli_pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn kill_cli(&self) {}
}

#[async_trait]
impl SandboxInstance for DockerInstance {
    fn id(&self) -> &str {
        &self.name
    }

    fn info(&self) -> SandboxInfo {
        let mut metadata = HashMap::from([("image".to_string(), self.image.clone())]);
        if let Some(pid) = self.host_pid.get() {
            metadata.insert("host_pid".to_string(), pid.to_string());
        }
        SandboxInfo {
            backend_type: "docker".to_string(),
            instance_id: self.name.clone(),
            metadata,
        }
    }

    async fn memory_usage(&self) -> Option<u64> {
        if self.reaped.load(Ordering::SeqCst) {
            return None;
        }
        let pid = self.resolve_host_pid().await?;
        procfs::rss_bytes(pid).await
    }

    async fn signal(&self, signal: StopSignal) -> Result<()> {
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.killed.store(true, Ordering::SeqCst);

        let sig = match signal {
            StopSignal::Graceful => "SIGTERM",
            StopSignal::Forced => "SIGKILL",
        };
        let output = self
            .docker_output(&["kill", &format!("--signal={}", sig), &self.name])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(name = %self.name, error = %stderr.trim(), "docker kill failed");
            if signal == StopSignal::Forced {
                // The container may not exist yet; the attached client must still go
                self.kill_cli();
            }
        }
        Ok(())
    }

    async fn wait(&self) -> Result<RawExit> {
        let status = {
            let mut guard = self.child.lock().await;
            let child = guard
                .as_mut()
                .ok_or_else(|| JudgeletError::Teardown("docker run client missing".to_string()))?;
            child.wait().await?
        };
        self.reaped.store(true, Ordering::SeqCst);

        let state = match self.inspect_state().await {
            Some(state) => state,
            None => (false, status.code().unwrap_or(EXIT_SIGKILL)),
        };

        Ok(classify_exit(state, self.killed.load(Ordering::SeqCst)))
    }

    async fn release(&self) -> Result<()> {
        self.remove_container().await;
        debug!(name = %self.name, "Container released");
        Ok(())
    }

    fn kill_now(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill_cli();
        let _ = std::process::Command::new(&self.docker)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

fn parse_state(output: &str) -> Option<(bool, i32)> {
    let mut parts = output.split_whitespace();
    let oom = parts.next()?.parse::<bool>().ok()?;
    let code = parts.next()?.parse::<i32>().ok()?;
    Some((oom, code))
}

/// Docker folds signals into `128 + signo`; split them back apart.
/// Turn the daemon's `(oom_killed, exit_code)` into a raw exit.
///
/// A SIGKILL the supervisor never sent is the memory ceiling, even when the
/// daemon does not flag it: the kernel may kill a process in the container's
/// cgroup without the container's init being the one chosen.
fn classify_exit((oom_reported, code): (bool, i32), supervisor_killed: bool) -> RawExit {
    let oom_killed = oom_reported || (code == EXIT_SIGKILL && !supervisor_killed);
    split_exit_code(code, oom_killed)
}

fn split_exit_code(code: i32, oom_killed: bool) -> RawExit {
    if code > 128 && code < 128 + 65 {
        RawExit {
            code: None,
            signal: Some(code - 128),
            oom_killed,
        }
    } else {
        RawExit {
            code: Some(code),
            signal: None,
            oom_killed,
        }
    }
}
