use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::types::NativeConfig;
use crate::error::{JudgeletError, Result};
use crate::sandbox::backends::cgroup::{self, CgroupScope};
use crate::sandbox::backends::procfs;
use crate::sandbox::spec::{RawExit, SandboxSpec};
use crate::sandbox::traits::{
    BackendCapabilities, Launched, SandboxBackend, SandboxInfo, SandboxInstance, SandboxStdio,
    StopSignal,
};

/// Native process sandbox.
///
/// Runs the candidate as the leader of its own process group with a clean
/// environment. Each execution gets its own cgroup v2 group with
/// `memory.max`, so the OOM killer stops the candidate detectably. The parent
/// is `cgroup_parent` when configured, else the harness's own group if the
/// memory controller is delegated to it. Without either, the backend is
/// unavailable unless `rlimit_fallback` allows `RLIMIT_AS` instead.
pub struct NativeBackend {
    config: NativeConfig,
    /// Where execution groups are created; None means RLIMIT_AS
    cgroup_parent: Option<PathBuf>,
    default_workdir: Option<String>,
}

impl NativeBackend {
    pub fn new(config: NativeConfig, default_workdir: Option<String>) -> Result<Self> {
        let cgroup_parent = resolve_cgroup_parent(&config)?;

        info!(
            cgroup_parent = ?cgroup_parent,
            "Native backend initialized"
        );

        Ok(Self {
            config,
            cgroup_parent,
            default_workdir,
        })
    }

    /// Whether `new` would succeed. Leaves the cgroup tree untouched.
    pub fn is_available(config: &NativeConfig) -> bool {
        match &config.cgroup_parent {
            Some(parent) => parent.join("cgroup.procs").exists(),
            None => config.rlimit_fallback || cgroup::delegated_parent().is_some(),
        }
    }

    fn build_command(&self, spec: &SandboxSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        cmd.env_clear();
        if self.config.inherit_path {
            if let Ok(path) = std::env::var("PATH") {
                cmd.env("PATH", path);
            }
        }
        for (key, value) in &spec.env_vars {
            cmd.env(key, value);
        }

        if let Some(dir) = spec.workdir.as_ref().or(self.default_workdir.as_ref()) {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.process_group(0);
        cmd
    }
}

fn unavailable(reason: String) -> JudgeletError {
    JudgeletError::BackendNotAvailable {
        backend: "native".to_string(),
        reason,
    }
}

/// Pick the directory execution groups are created under.
fn resolve_cgroup_parent(config: &NativeConfig) -> Result<Option<PathBuf>> {
    if let Some(parent) = &config.cgroup_parent {
        if !parent.join("cgroup.procs").exists() {
            return Err(unavailable(format!(
                "{} is not a cgroup v2 directory (no cgroup.procs)",
                parent.display()
            )));
        }
        cgroup::enable_memory_controller(parent).map_err(|e| {
            unavailable(format!(
                "cannot enable the memory controller under {}: {}",
                parent.display(),
                e
            ))
        })?;
        return Ok(Some(parent.clone()));
    }

    if let Some(parent) = cgroup::delegated_parent() {
        match cgroup::enable_memory_controller(&parent) {
            Ok(()) => return Ok(Some(parent)),
            Err(e) => debug!(path = %parent.display(), error = %e, "Delegated cgroup unusable"),
        }
    }

    if config.rlimit_fallback {
        warn!("No usable cgroup v2 group; capping memory with RLIMIT_AS, breaches show up as candidate failures");
        return Ok(None);
    }

    Err(unavailable(
        "no delegated cgroup v2 group with the memory controller; set sandbox.native.cgroup_parent or sandbox.native.rlimit_fallback"
            .to_string(),
    ))
}

/// Apply RLIMIT_AS in the child between fork and exec.
fn apply_rlimit(cmd: &mut Command, memory_limit: u64) {
    // SAFETY: pre_exec runs between fork() and exec() in the child process.
    // The closure only calls setrlimit, which is async-signal-safe, on a
    // Copy value moved into the closure.
    unsafe {
        cmd.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: memory_limit as libc::rlim_t,
                rlim_max: memory_limit as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Join the cgroup in the child between fork and exec.
fn apply_cgroup(cmd: &mut Command, procs: std::fs::File) {
    use std::io::Write;

    // SAFETY: pre_exec runs between fork() and exec() in the child process.
    // Writing "0" to an already opened cgroup.procs is a single write(2)
    // moving the calling process into the group; nothing is allocated.
    unsafe {
        cmd.pre_exec(move || (&procs).write_all(b"0"));
    }
}

#[async_trait]
impl SandboxBackend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            oom_detection: self.cgroup_parent.is_some(),
            networking: true,
        }
    }

    async fn launch(&self, spec: &SandboxSpec) -> Result<Launched> {
        let (instance, stdio) = self.spawn(spec)?;
        Ok(Launched {
            instance: Arc::new(instance),
            stdio,
        })
    }
}

impl NativeBackend {
    fn spawn(&self, spec: &SandboxSpec) -> Result<(NativeInstance, SandboxStdio)> {
        let name = format!("judgelet-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = self.build_command(spec);

        let cgroup = match &self.cgroup_parent {
            Some(parent) => {
                let scope = CgroupScope::create(parent, &name, spec.limits.memory_limit)?;
                apply_cgroup(&mut cmd, scope.procs_file()?);
                Some(scope)
            }
            None => {
                apply_rlimit(&mut cmd, spec.limits.memory_limit);
                None
            }
        };

        // A failed spawn drops the cgroup scope, which removes the group
        let mut child = cmd.spawn().map_err(|e| {
            JudgeletError::Launch(format!("Failed to spawn '{}': {}", spec.program, e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| JudgeletError::Launch("Child exited before it was tracked".to_string()))?;

        let stdio = take_stdio(&mut child)?;

        debug!(pid, name = %name, "Native sandbox launched");

        let instance = NativeInstance {
            id: pid.to_string(),
            name,
            pid,
            child: Mutex::new(child),
            reaped: AtomicBool::new(false),
            cgroup,
        };

        Ok((instance, stdio))
    }
}

fn take_stdio(child: &mut Child) -> Result<SandboxStdio> {
    let missing = |stream: &str| JudgeletError::Launch(format!("Child {} was not captured", stream));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    Ok(SandboxStdio {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
    })
}

struct NativeInstance {
    id: String,
    name: String,
    pid: u32,
    child: Mutex<Child>,
    reaped: AtomicBool,
    cgroup: Option<CgroupScope>,
}

impl NativeInstance {
    /// Signal the candidate's process group; false when nothing was sent.
    ///
    /// Once the leader is reaped its pgid may be reused by another group, so
    /// no signal goes out after that.
    fn signal_group(&self, signal: Signal) -> Result<bool> {
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(true),
            Err(e) => Err(JudgeletError::Signal(format!(
                "killpg({}, {}) failed: {}",
                self.pid,
                signal.as_str(),
                e
            ))),
        }
    }
}

#[async_trait]
impl SandboxInstance for NativeInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> SandboxInfo {
        let mut metadata = HashMap::from([("name".to_string(), self.name.clone())]);
        if let Some(cgroup) = &self.cgroup {
            metadata.insert("cgroup".to_string(), cgroup.path().display().to_string());
        }
        SandboxInfo {
            backend_type: "native".to_string(),
            instance_id: self.id.clone(),
            metadata,
        }
    }

    async fn memory_usage(&self) -> Option<u64> {
        if self.reaped.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(cgroup) = &self.cgroup {
            return cgroup.memory_current().await;
        }
        procfs::rss_bytes(self.pid).await
    }

    async fn signal(&self, signal: StopSignal) -> Result<()> {
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }
        match signal {
            StopSignal::Graceful => {
                self.signal_group(Signal::SIGTERM)?;
            }
            StopSignal::Forced => {
                if let Some(cgroup) = &self.cgroup {
                    if let Err(e) = cgroup.kill_all() {
                        warn!(id = %self.id, error = %e, "cgroup.kill failed");
                    }
                }
                self.signal_group(Signal::SIGKILL)?;
            }
        }
        Ok(())
    }

    async fn wait(&self) -> Result<RawExit> {
        use std::os::unix::process::ExitStatusExt;

        let status = self.child.lock().await.wait().await?;
        self.reaped.store(true, Ordering::SeqCst);

        let oom_killed = match &self.cgroup {
            Some(cgroup) => cgroup.oom_kills().await > 0,
            None => false,
        };

        Ok(RawExit {
            code: status.code(),
            signal: status.signal(),
            oom_killed,
        })
    }

    async fn release(&self) -> Result<()> {
        match &self.cgroup {
            // cgroup.kill reaches stragglers that left the leader behind
            Some(cgroup) => cgroup.remove().await?,
            None => {
                if let Err(e) = self.signal_group(Signal::SIGKILL) {
                    warn!(id = %self.id, error = %e, "Failed to kill process group on release");
                }
            }
        }
        debug!(id = %self.id, "Native sandbox released");
        Ok(())
    }

    fn kill_now(&self) {
        if let Some(cgroup) = &self.cgroup {
            let _ = cgroup.kill_all();
        }
        let _ = self.signal_group(Signal::SIGKILL);
    }
}
