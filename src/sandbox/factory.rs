use std::sync::Arc;

use crate::config::types::{BackendType, NativeConfig, SandboxConfig};
use crate::error::{JudgeletError, Result};
use crate::sandbox::traits::SandboxBackend;

use crate::sandbox::backends::DockerBackend;

#[cfg(target_os = "linux")]
use crate::sandbox::backends::NativeBackend;

/// Create a sandbox backend based on the configuration.
///
/// This factory function selects and instantiates the appropriate backend
/// based on the configured backend type and platform availability. The
/// backend is shared by every execution the harness runs.
pub async fn create_backend(config: &SandboxConfig) -> Result<Arc<dyn SandboxBackend>> {
    let backend_type = resolve_backend_type(config)?;

    match backend_type {
        BackendType::Docker => {
            let backend =
                DockerBackend::new(config.docker.clone(), config.default_workdir.clone())?;
            Ok(Arc::new(backend))
        }

        #[cfg(target_os = "linux")]
        BackendType::Native => {
            let backend =
                NativeBackend::new(config.native.clone(), config.default_workdir.clone())?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(target_os = "linux"))]
        BackendType::Native => Err(JudgeletError::BackendNotAvailable {
            backend: "native".to_string(),
            reason: "The native backend is only available on Linux".to_string(),
        }),

        BackendType::Auto => Err(JudgeletError::BackendNotAvailable {
            backend: "auto".to_string(),
            reason: "No sandbox backends available".to_string(),
        }),
    }
}

/// Resolve the backend type, handling Auto selection.
fn resolve_backend_type(config: &SandboxConfig) -> Result<BackendType> {
    match &config.backend {
        BackendType::Auto => {
            // Priority: Docker (container isolation) > Native
            if DockerBackend::is_available() {
                return Ok(BackendType::Docker);
            }
            if native_available(&config.native) {
                return Ok(BackendType::Native);
            }
            Err(JudgeletError::BackendNotAvailable {
                backend: "auto".to_string(),
                reason: "No sandbox backends available".to_string(),
            })
        }
        BackendType::Docker => {
            if !DockerBackend::is_available() {
                return Err(JudgeletError::BackendNotAvailable {
                    backend: "docker".to_string(),
                    reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                        .to_string(),
                });
            }
            Ok(BackendType::Docker)
        }
        BackendType::Native => Ok(BackendType::Native),
    }
}

fn native_available(config: &NativeConfig) -> bool {
    #[cfg(target_os = "linux")]
    {
        NativeBackend::is_available(config)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        false
    }
}

/// Get information about available backends on this system.
pub fn available_backends(config: &SandboxConfig) -> Vec<BackendInfo> {
    let docker = DockerBackend::is_available();
    let native = native_available(&config.native);

    vec![
        BackendInfo {
            name: "docker",
            available: docker,
            description: "Docker container sandbox with a cgroup memory cap",
            unavailable_reason: if docker {
                None
            } else {
                Some("Docker daemon not accessible")
            },
        },
        BackendInfo {
            name: "native",
            available: native,
            description: "Process group with cgroup v2 or rlimit memory cap",
            unavailable_reason: if native {
                None
            } else if cfg!(target_os = "linux") {
                Some("No delegated cgroup v2 group; set cgroup_parent or rlimit_fallback")
            } else {
                Some("Only available on Linux")
            },
        },
    ]
}

/// Information about a sandbox backend.
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}
