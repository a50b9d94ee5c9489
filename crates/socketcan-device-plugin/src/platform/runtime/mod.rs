//! Container runtime introspection.
//!
//! The allocation worker only knows the container-local path of the device it
//! handed to kubelet. A [`ContainerResolver`] turns that path into a container
//! ID and the container ID into the host PID whose network namespace receives
//! the CAN link.

pub mod docker;
pub mod procfs;

use std::path::PathBuf;
use std::sync::Arc;

use clap::ValueEnum;
use thiserror::Error;

pub use docker::DockerResolver;
pub use procfs::ProcfsResolver;

/// A container located through its mounted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: String,
    pub pid: u32,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The container is not visible yet; callers treat this as transient.
    #[error("no container found for {0}")]
    NotFound(String),

    #[error("container {0} is not running")]
    NotRunning(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected container runtime response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Maps a device path inside a container to the container and its process.
///
/// Both lookups fail with an error, never a panic, while the container does
/// not exist yet.
#[tonic::async_trait]
pub trait ContainerResolver: Send + Sync {
    /// Checks that the runtime can be queried at all.
    async fn connect(&self) -> Result<(), ResolveError>;

    /// Returns the ID of the container that has `container_path` mounted.
    async fn container_id_by_device_path(&self, container_path: &str)
        -> Result<String, ResolveError>;

    /// Returns the host PID of the container's init process.
    async fn pid_by_container_id(&self, container_id: &str) -> Result<u32, ResolveError>;

    /// Resolves both steps in one go.
    async fn resolve(&self, container_path: &str) -> Result<ContainerHandle, ResolveError> {
        let container_id = self.container_id_by_device_path(container_path).await?;
        let pid = self.pid_by_container_id(&container_id).await?;
        Ok(ContainerHandle { container_id, pid })
    }
}

/// Selects the [`ContainerResolver`] backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ContainerRuntime {
    /// Docker Engine API over its unix socket.
    #[default]
    Docker,
    /// Scan `/proc` for containerised processes; works with any runtime.
    Procfs,
}

/// Builds the resolver selected by `runtime`.
pub fn build_resolver(
    runtime: ContainerRuntime,
    docker_socket: PathBuf,
    proc_root: PathBuf,
) -> Arc<dyn ContainerResolver> {
    match runtime {
        ContainerRuntime::Docker => Arc::new(DockerResolver::new(docker_socket)),
        ContainerRuntime::Procfs => Arc::new(ProcfsResolver::new(proc_root)),
    }
}
