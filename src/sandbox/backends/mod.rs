#[cfg(target_os = "linux")]
mod cgroup;
mod docker;
#[cfg(target_os = "linux")]
mod native;
mod procfs;

pub use docker::DockerBackend;
#[cfg(target_os = "linux")]
pub use native::NativeBackend;
