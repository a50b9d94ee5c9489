//! Runtime-agnostic resolver that scans the `/proc` filesystem.
//!
//! A process belongs to a container when its cgroup path carries a 64 digit
//! hex container ID (`docker-<id>.scope`, `cri-containerd-<id>.scope`,
//! `crio-<id>.scope` or a bare `<id>` segment). The device path is looked up
//! through `/proc/<pid>/root`, which exposes the container's root filesystem.

use std::path::Path;
use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

use super::ContainerResolver;
use super::ResolveError;

const CONTAINER_ID_LEN: usize = 64;

/// Scans a procfs mount for containerised processes.
#[derive(Debug, Clone)]
pub struct ProcfsResolver {
    proc_root: PathBuf,
}

impl ProcfsResolver {
    pub fn new(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }

    /// Lists numeric entries of the proc root in ascending PID order.
    async fn pids(&self) -> Result<Vec<u32>, ResolveError> {
        let mut entries = fs::read_dir(&self.proc_root).await?;
        let mut pids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        Ok(pids)
    }

    /// Returns the container ID of `pid`, or `None` for host processes and
    /// processes that exited while scanning.
    async fn container_id_of(&self, pid: u32) -> Option<String> {
        let cgroup = fs::read_to_string(self.proc_root.join(pid.to_string()).join("cgroup"))
            .await
            .ok()?;
        parse_container_id(&cgroup)
    }

    fn path_in_root(&self, pid: u32, container_path: &str) -> PathBuf {
        self.proc_root
            .join(pid.to_string())
            .join("root")
            .join(container_path.trim_start_matches('/'))
    }
}

/// Extracts the innermost container ID from the contents of a cgroup file.
fn parse_container_id(cgroup: &str) -> Option<String> {
    cgroup
        .lines()
        .filter_map(|line| line.rsplit(':').next())
        .flat_map(|path| path.split('/'))
        .filter_map(|segment| {
            let segment = segment.strip_suffix(".scope").unwrap_or(segment);
            let candidate = segment.rsplit('-').next().unwrap_or(segment);
            is_container_id(candidate).then(|| candidate.to_string())
        })
        .last()
}

fn is_container_id(candidate: &str) -> bool {
    candidate.len() == CONTAINER_ID_LEN && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

#[tonic::async_trait]
impl ContainerResolver for ProcfsResolver {
    async fn connect(&self) -> Result<(), ResolveError> {
        fs::read_dir(&self.proc_root).await.map_err(|e| {
            ResolveError::Unavailable(format!("{}: {e}", self.proc_root.display()))
        })?;
        Ok(())
    }

    async fn container_id_by_device_path(
        &self,
        container_path: &str,
    ) -> Result<String, ResolveError> {
        for pid in self.pids().await? {
            let Some(container_id) = self.container_id_of(pid).await else {
                continue;
            };

            if exists(&self.path_in_root(pid, container_path)).await {
                debug!(pid, container_id = %container_id, "found container by device path");
                return Ok(container_id);
            }
        }

        Err(ResolveError::NotFound(container_path.to_string()))
    }

    async fn pid_by_container_id(&self, container_id: &str) -> Result<u32, ResolveError> {
        for pid in self.pids().await? {
            if self.container_id_of(pid).await.as_deref() == Some(container_id) {
                return Ok(pid);
            }
        }

        Err(ResolveError::NotFound(container_id.to_string()))
    }
}
