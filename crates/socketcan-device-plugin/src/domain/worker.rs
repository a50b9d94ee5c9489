//! Allocation worker.
//!
//! Each device plugin owns exactly one worker. It drains the allocation queue
//! in order and, for every allocation, keeps trying to resolve the container
//! and provision the tunnel until it succeeds or the attempt budget is spent.
//! The container usually does not exist yet when kubelet calls `Allocate`, so
//! resolution failures are expected for the first few attempts.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::allocation::Allocation;
use super::allocation::AllocationReceiver;
use crate::platform::network::NetworkProvisioner;
use crate::platform::network::ProvisionError;
use crate::platform::runtime::ContainerResolver;
use crate::platform::runtime::ResolveError;

/// Default number of attempts per allocation.
pub const DEFAULT_PROVISION_ATTEMPTS: u32 = 10;

/// Default backoff unit.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Linear retry schedule: after failed attempt `i` (0-based) the worker
/// sleeps `i` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub unit: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROVISION_ATTEMPTS,
            unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl Backoff {
    pub fn new(attempts: u32, unit: Duration) -> Self {
        Self { attempts, unit }
    }

    /// Delay after the failed attempt with index `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit * attempt
    }
}

/// How a single allocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// The tunnel is up; `attempts` counts every attempt including the last.
    Provisioned { pid: u32, attempts: u32 },
    /// Every attempt failed; the allocation is dropped.
    Exhausted,
    /// Shutdown was requested while retrying.
    Cancelled,
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("container lookup failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("pod attachment failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("provisioning task failed: {0}")]
    Task(#[from] JoinError),
}

impl AttemptError {
    /// The container is not there yet; expected right after `Allocate`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Resolve(ResolveError::NotFound(_) | ResolveError::NotRunning(_))
        )
    }
}

/// Consumes allocations for one device plugin.
pub struct AllocationWorker {
    device_name: String,
    receiver: AllocationReceiver,
    resolver: Arc<dyn ContainerResolver>,
    provisioner: Arc<NetworkProvisioner>,
    backoff: Backoff,
}

impl AllocationWorker {
    pub fn new(
        device_name: String,
        receiver: AllocationReceiver,
        resolver: Arc<dyn ContainerResolver>,
        provisioner: Arc<NetworkProvisioner>,
        backoff: Backoff,
    ) -> Self {
        Self {
            device_name,
            receiver,
            resolver,
            provisioner,
            backoff,
        }
    }

    /// Processes allocations until the queue closes or `cancellation_token`
    /// fires.
    #[tracing::instrument(skip_all, fields(device = %self.device_name))]
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        info!("allocation worker started");

        loop {
            let allocation = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(allocation) => allocation,
                    None => break,
                },
            };

            if self.process(allocation, &cancellation_token).await == AllocationOutcome::Cancelled {
                break;
            }
        }

        info!("allocation worker stopped");
    }

    /// Runs the attempt loop for one allocation.
    pub async fn process(
        &self,
        allocation: Allocation,
        cancellation_token: &CancellationToken,
    ) -> AllocationOutcome {
        info!(
            device_id = %allocation.device_id,
            container_path = %allocation.container_path,
            "new allocation request"
        );

        for attempt in 0..self.backoff.attempts {
            match self.attempt(&allocation).await {
                Ok(pid) => {
                    info!(
                        device_id = %allocation.device_id,
                        pid,
                        attempt,
                        "successfully created vxcan interface"
                    );
                    return AllocationOutcome::Provisioned {
                        pid,
                        attempts: attempt + 1,
                    };
                }
                Err(e) if e.is_transient() => {
                    debug!(device_id = %allocation.device_id, attempt, "attempt failed: {e}");
                }
                Err(e) => {
                    warn!(device_id = %allocation.device_id, attempt, "attempt failed: {e}");
                }
            }

            if attempt + 1 == self.backoff.attempts {
                break;
            }

            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    warn!(device_id = %allocation.device_id, "shutdown requested, abandoning allocation");
                    return AllocationOutcome::Cancelled;
                }
                _ = sleep(self.backoff.delay(attempt)) => {}
            }
        }

        error!(
            device_id = %allocation.device_id,
            container_path = %allocation.container_path,
            attempts = self.backoff.attempts,
            "giving up on allocation"
        );
        AllocationOutcome::Exhausted
    }

    /// One resolve-and-provision attempt; returns the container PID.
    async fn attempt(&self, allocation: &Allocation) -> Result<u32, AttemptError> {
        let handle = self.resolver.resolve(&allocation.container_path).await?;

        let provisioner = self.provisioner.clone();
        let device_id = allocation.device_id.clone();
        let pid = handle.pid;

        tokio::task::spawn_blocking(move || provisioner.provision(&device_id, pid)).await??;

        Ok(pid)
    }
}
