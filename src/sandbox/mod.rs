mod backends;
mod factory;
mod latch;
mod spec;
mod supervisor;
mod traits;

pub use backends::DockerBackend;

#[cfg(target_os = "linux")]
pub use backends::NativeBackend;

pub use factory::{available_backends, create_backend, BackendInfo};
pub use latch::TerminationLatch;
pub use spec::{signal_name, ExitInfo, RawExit, ResourceLimits, SandboxSpec, TerminationReason};
pub use supervisor::{SandboxHandle, Supervisor, Teardown};
pub use traits::{
    BackendCapabilities, Launched, SandboxBackend, SandboxInfo, SandboxInstance, SandboxStdio,
    StopSignal,
};
