//! vxcan tunnel provisioning.
//!
//! A host CAN interface is bridged into a container by creating a vxcan pair,
//! moving one end into the container's network namespace under the original
//! interface name, and installing `cangw` rules in both directions between the
//! host interface and the host end of the tunnel.

use std::sync::Arc;

use clap::ValueEnum;
use derive_more::Display;
use thiserror::Error;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::command::CommandRunner;

/// One host command of the provisioning sequence.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    #[display("create-pair")]
    CreatePair,
    #[display("move-to-namespace")]
    MoveToNamespace,
    #[display("bring-up-host-end")]
    BringUpHostEnd,
    #[display("rename-in-namespace")]
    RenameInNamespace,
    #[display("bring-up-in-namespace")]
    BringUpInNamespace,
    #[display("forward-host-to-tunnel")]
    ForwardHostToTunnel,
    #[display("forward-tunnel-to-host")]
    ForwardTunnelToHost,
}

impl ProvisionStep {
    fn is_gateway_rule(self) -> bool {
        matches!(
            self,
            ProvisionStep::ForwardHostToTunnel | ProvisionStep::ForwardTunnelToHost
        )
    }
}

/// Decides which step failures make the whole provisioning fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProvisionPolicy {
    /// Every step has to succeed.
    #[default]
    AllSteps,
    /// Only the two `cangw` rules have to succeed.
    GatewayRules,
    /// Step failures are logged and the call always succeeds.
    BestEffort,
}

impl ProvisionPolicy {
    fn accepts(self, failed: &[ProvisionStep]) -> bool {
        match self {
            ProvisionPolicy::AllSteps => failed.is_empty(),
            ProvisionPolicy::GatewayRules => !failed.iter().any(|step| step.is_gateway_rule()),
            ProvisionPolicy::BestEffort => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning {device} into pid {pid} failed at steps [{}]", join_steps(.failed))]
    StepsFailed {
        device: String,
        pid: u32,
        failed: Vec<ProvisionStep>,
    },
}

fn join_steps(steps: &[ProvisionStep]) -> String {
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Interface names derived from a device and the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelNames {
    /// End that stays on the host, e.g. `vxcan0_4242_1`.
    pub host_end: String,
    /// End that is moved into the container, e.g. `vxcan0_42420_1`.
    pub namespace_end: String,
}

impl TunnelNames {
    pub fn new(device: &str, pid: u32) -> Self {
        let tunnel = format!("{device}_{pid}");
        Self {
            host_end: format!("vx{tunnel}_1"),
            namespace_end: format!("vx{tunnel}0_1"),
        }
    }
}

/// Builds and runs the provisioning command sequence.
pub struct NetworkProvisioner {
    runner: Arc<dyn CommandRunner>,
    policy: ProvisionPolicy,
}

impl NetworkProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, policy: ProvisionPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn policy(&self) -> ProvisionPolicy {
        self.policy
    }

    /// Returns the ordered command sequence for `device` and `pid`.
    pub fn commands(device: &str, pid: u32) -> Vec<(ProvisionStep, String)> {
        let TunnelNames {
            host_end,
            namespace_end,
        } = TunnelNames::new(device, pid);

        vec![
            (
                ProvisionStep::CreatePair,
                format!("ip link add {host_end} type vxcan peer name {namespace_end}"),
            ),
            (
                ProvisionStep::MoveToNamespace,
                format!("ip link set {namespace_end} netns {pid}"),
            ),
            (
                ProvisionStep::BringUpHostEnd,
                format!("ip link set {host_end} up"),
            ),
            (
                ProvisionStep::RenameInNamespace,
                format!("nsenter -t {pid} -n ip link set {namespace_end} name {device}"),
            ),
            (
                ProvisionStep::BringUpInNamespace,
                format!("nsenter -t {pid} -n ip link set {device} up"),
            ),
            (
                ProvisionStep::ForwardHostToTunnel,
                format!("cangw -A -s {device} -d {host_end} -e"),
            ),
            (
                ProvisionStep::ForwardTunnelToHost,
                format!("cangw -A -s {host_end} -d {device} -e"),
            ),
        ]
    }

    /// Bridges `device` into the network namespace of `pid`.
    ///
    /// All steps are attempted even when an earlier one fails. The outcome is
    /// decided by the configured [`ProvisionPolicy`]; on failure the host end of
    /// the pair is deleted again, which also removes the namespace end and any
    /// `cangw` job bound to it.
    #[tracing::instrument(level = "info", skip(self), fields(policy = ?self.policy))]
    pub fn provision(&self, device: &str, pid: u32) -> Result<(), ProvisionError> {
        info!("creating vxcan tunnel into container namespace");

        let mut failed = Vec::new();
        for (step, command) in Self::commands(device, pid) {
            if let Err(e) = self.runner.run(&command) {
                error!(%step, command = %command, "provisioning step failed: {e}");
                failed.push(step);
            }
        }

        if self.policy.accepts(&failed) {
            if !failed.is_empty() {
                warn!(failed = %join_steps(&failed), "tunnel provisioned with failed steps");
            }
            info!("tunnel provisioned");
            return Ok(());
        }

        if !failed.contains(&ProvisionStep::CreatePair) {
            self.rollback(device, pid);
        }

        Err(ProvisionError::StepsFailed {
            device: device.to_string(),
            pid,
            failed,
        })
    }

    fn rollback(&self, device: &str, pid: u32) {
        let host_end = TunnelNames::new(device, pid).host_end;
        if let Err(e) = self.runner.run(&format!("ip link del {host_end}")) {
            warn!(interface = %host_end, "failed to remove tunnel after failed provisioning: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::network::command::testing::RecordingRunner;

    fn expected_sequence() -> Vec<String> {
        vec![
            "ip link add vxcan0_4242_1 type vxcan peer name vxcan0_42420_1".to_string(),
            "ip link set vxcan0_42420_1 netns 4242".to_string(),
            "ip link set vxcan0_4242_1 up".to_string(),
            "nsenter -t 4242 -n ip link set vxcan0_42420_1 name can0".to_string(),
            "nsenter -t 4242 -n ip link set can0 up".to_string(),
            "cangw -A -s can0 -d vxcan0_4242_1 -e".to_string(),
            "cangw -A -s vxcan0_4242_1 -d can0 -e".to_string(),
        ]
    }

    #[test]
    fn tunnel_names_follow_device_and_pid() {
        assert_eq!(
            TunnelNames::new("can0", 4242),
            TunnelNames {
                host_end: "vxcan0_4242_1".to_string(),
                namespace_end: "vxcan0_42420_1".to_string(),
            }
        );
    }

    #[test]
    fn issues_steps_in_order() {
        let runner = Arc::new(RecordingRunner::new());
        let provisioner = NetworkProvisioner::new(runner.clone(), ProvisionPolicy::AllSteps);

        provisioner
            .provision("can0", 4242)
            .expect("all steps succeed");

        assert_eq!(runner.recorded(), expected_sequence());
    }

    #[test]
    fn rename_failure_still_attempts_gateway_rules() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("nsenter -t 4242 -n ip link set vxcan0_42420_1 name");
        let provisioner = NetworkProvisioner::new(runner.clone(), ProvisionPolicy::AllSteps);

        let err = provisioner
            .provision("can0", 4242)
            .expect_err("rename failure fails under all-steps");

        let recorded = runner.recorded();
        assert_eq!(&recorded[..7], expected_sequence().as_slice());
        assert_eq!(recorded[7], "ip link del vxcan0_4242_1");
        match err {
            ProvisionError::StepsFailed { failed, .. } => {
                assert_eq!(failed, vec![ProvisionStep::RenameInNamespace])
            }
        }
    }

    #[test]
    fn gateway_policy_ignores_namespace_step_failures() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("nsenter");
        let provisioner = NetworkProvisioner::new(runner.clone(), ProvisionPolicy::GatewayRules);

        provisioner
            .provision("can0", 4242)
            .expect("gateway rules succeeded");

        assert_eq!(runner.recorded(), expected_sequence());
    }

    #[test]
    fn gateway_policy_fails_on_cangw_failure() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("cangw -A -s vxcan0_4242_1");
        let provisioner = NetworkProvisioner::new(runner.clone(), ProvisionPolicy::GatewayRules);

        assert!(provisioner.provision("can0", 4242).is_err());
        assert_eq!(
            runner.recorded().last().map(String::as_str),
            Some("ip link del vxcan0_4242_1")
        );
    }

    #[test]
    fn best_effort_always_succeeds() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("ip link");
        runner.fail_on("cangw");
        let provisioner = NetworkProvisioner::new(runner.clone(), ProvisionPolicy::BestEffort);

        provisioner
            .provision("can0", 4242)
            .expect("best effort never fails");

        assert_eq!(runner.recorded().len(), 7);
    }

    #[test]
    fn no_rollback_when_pair_was_never_created() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("ip link add");
        let provisioner = NetworkProvisioner::new(runner.clone(), ProvisionPolicy::AllSteps);

        assert!(provisioner.provision("can0", 4242).is_err());
        assert_eq!(runner.recorded(), expected_sequence());
    }

    #[test]
    fn error_lists_failed_steps() {
        let err = ProvisionError::StepsFailed {
            device: "can1".to_string(),
            pid: 7,
            failed: vec![
                ProvisionStep::MoveToNamespace,
                ProvisionStep::ForwardTunnelToHost,
            ],
        };

        assert_eq!(
            err.to_string(),
            "provisioning can1 into pid 7 failed at steps [move-to-namespace, forward-tunnel-to-host]"
        );
    }
}
