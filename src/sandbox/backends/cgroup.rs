//! Per-execution cgroup v2 group with a hard memory ceiling.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{access, AccessFlags};
use tracing::{debug, info, warn};

use crate::error::{JudgeletError, Result};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Leaf the harness moves its own processes into so the group above it can
/// hand the memory controller down to execution groups.
const HARNESS_LEAF: &str = "judgelet-harness";

/// The harness's own cgroup v2 group, if it may create execution groups there.
///
/// Does not change anything; `enable_memory_controller` does the setup.
pub fn delegated_parent() -> Option<PathBuf> {
    let content = fs::read_to_string("/proc/self/cgroup").ok()?;
    let own = Path::new(CGROUP_ROOT).join(parse_own_cgroup(&content)?);

    let parent = if own.file_name() == Some(OsStr::new(HARNESS_LEAF)) {
        own.parent()?.to_path_buf()
    } else {
        own
    };

    let controllers = fs::read_to_string(parent.join("cgroup.controllers")).ok()?;
    if !lists_memory(&controllers) {
        debug!(path = %parent.display(), "memory controller not delegated");
        return None;
    }

    let writable = ["", "cgroup.subtree_control", "cgroup.procs"]
        .iter()
        .all(|file| access(&parent.join(file), AccessFlags::W_OK).is_ok());
    if !writable {
        debug!(path = %parent.display(), "cgroup not writable");
        return None;
    }

    Some(parent)
}

/// Enable the memory controller for children of `parent`.
///
/// A non-root group with member processes cannot hand controllers down, so
/// its processes are moved into a leaf first.
pub fn enable_memory_controller(parent: &Path) -> io::Result<()> {
    let control = parent.join("cgroup.subtree_control");
    if lists_memory(&fs::read_to_string(&control)?) {
        return Ok(());
    }
    if fs::write(&control, "+memory").is_ok() {
        return Ok(());
    }

    let leaf = parent.join(HARNESS_LEAF);
    match fs::create_dir(&leaf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    let procs = fs::read_to_string(parent.join("cgroup.procs"))?;
    for pid in procs.split_whitespace() {
        if let Err(e) = fs::write(leaf.join("cgroup.procs"), pid) {
            // Exited between the read and the move
            if e.raw_os_error() != Some(libc::ESRCH) {
                return Err(e);
            }
        }
    }

    fs::write(&control, "+memory")?;
    info!(path = %parent.display(), "Enabled memory controller for execution groups");
    Ok(())
}

/// Path of the calling process's group relative to the cgroup v2 mount.
fn parse_own_cgroup(content: &str) -> Option<PathBuf> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| PathBuf::from(path.trim().trim_start_matches('/')))
}

fn lists_memory(controllers: &str) -> bool {
    controllers.split_whitespace().any(|c| c == "memory")
}

/// A child group under a delegated cgroup v2 directory.
///
/// The directory is removed when the scope is dropped, so a launch that
/// fails halfway leaves nothing behind.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
}

impl CgroupScope {
    /// Create `<parent>/<name>` with `memory.max` set to `memory_limit` and swap disabled.
    pub fn create(parent: &Path, name: &str, memory_limit: u64) -> Result<Self> {
        let path = parent.join(name);
        fs::create_dir(&path).map_err(|e| {
            JudgeletError::Launch(format!(
                "Failed to create cgroup {}: {}",
                path.display(),
                e
            ))
        })?;

        // From here on the guard owns the directory
        let scope = Self { path };

        scope.write("memory.max", &memory_limit.to_string())?;

        if let Err(e) = scope.write("memory.swap.max", "0") {
            // Kernels without swap accounting have no such file
            debug!(error = %e, "memory.swap.max not set");
        }
        if scope.path.join("memory.oom.group").exists() {
            scope.write("memory.oom.group", "1")?;
        }

        debug!(path = %scope.path.display(), memory_limit, "Created cgroup");
        Ok(scope)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opened before fork so the child can join the group with a single write.
    pub fn procs_file(&self) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
            .map_err(|e| JudgeletError::Launch(format!("Failed to open cgroup.procs: {}", e)))
    }

    pub async fn memory_current(&self) -> Option<u64> {
        let content = tokio::fs::read_to_string(self.path.join("memory.current"))
            .await
            .ok()?;
        content.trim().parse().ok()
    }

    /// Number of OOM kills recorded for this group.
    pub async fn oom_kills(&self) -> u64 {
        match tokio::fs::read_to_string(self.path.join("memory.events")).await {
            Ok(content) => parse_oom_kills(&content),
            Err(_) => 0,
        }
    }

    /// Kill every process in the group (kernel 5.14+).
    pub fn kill_all(&self) -> io::Result<()> {
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            fs::write(kill, "1")?;
        }
        Ok(())
    }

    /// Kill remaining members and remove the directory.
    pub async fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if let Err(e) = self.kill_all() {
            warn!(path = %self.path.display(), error = %e, "cgroup.kill failed");
        }

        // rmdir fails with EBUSY until the kernel has finished reaping members
        let mut last_error = None;
        for _ in 0..50 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => last_error = Some(e),
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Err(JudgeletError::Teardown(format!(
            "Failed to remove cgroup {}: {}",
            self.path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value).map_err(|e| {
            JudgeletError::Launch(format!("Failed to write {}={}: {}", file, value, e))
        })
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = self.kill_all();
            let _ = fs::remove_dir(&self.path);
        }
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
