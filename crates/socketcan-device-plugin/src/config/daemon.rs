use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::lister::DEFAULT_RESOURCE_NAMESPACE;
use crate::domain::worker::Backoff;
use crate::platform::fake_device::FAKE_DEVICE_HOST_PATH;
use crate::platform::network::ProvisionPolicy;
use crate::platform::runtime::ContainerRuntime;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "SOCKETCAN_DEVICES",
        default_value = "",
        help = "Space separated SocketCAN interfaces to advertise, e.g. \"can0 can1\""
    )]
    pub devices: String,

    #[arg(
        long,
        env = "SOCKETCAN_RESOURCE_NAMESPACE",
        default_value = DEFAULT_RESOURCE_NAMESPACE,
        help = "Namespace of the advertised extended resources"
    )]
    pub resource_namespace: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory where device plugin sockets are created"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        default_value = "/var/lib/kubelet/device-plugins/kubelet.sock",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        default_value = FAKE_DEVICE_HOST_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Host path of the placeholder block device handed to containers"
    )]
    pub fake_device_path: PathBuf,

    #[arg(
        long,
        env = "CONTAINER_RUNTIME",
        value_enum,
        default_value_t = ContainerRuntime::Docker,
        help = "How allocated containers are located"
    )]
    pub container_runtime: ContainerRuntime,

    #[arg(
        long,
        env = "DOCKER_HOST_SOCKET",
        default_value = "/var/run/docker.sock",
        value_hint = clap::ValueHint::FilePath,
        help = "Docker Engine API socket, used by the docker runtime"
    )]
    pub docker_socket: PathBuf,

    #[arg(
        long,
        default_value = "/proc",
        value_hint = clap::ValueHint::DirPath,
        help = "Host procfs mount, used by the procfs runtime"
    )]
    pub proc_root: PathBuf,

    #[arg(
        long,
        default_value_t = crate::domain::worker::DEFAULT_PROVISION_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Attempts to locate and provision a container before giving up"
    )]
    pub provision_attempts: u32,

    #[arg(
        long,
        default_value = "1000",
        help = "Linear backoff unit in milliseconds; attempt n waits n units"
    )]
    pub backoff_unit_ms: u64,

    #[arg(
        long,
        value_enum,
        default_value_t = ProvisionPolicy::AllSteps,
        help = "Which failed provisioning steps make an attempt fail"
    )]
    pub provision_policy: ProvisionPolicy,
}

impl DaemonArgs {
    /// Distinct device names in configuration order.
    pub fn device_names(&self) -> Vec<String> {
        parse_device_list(&self.devices)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.provision_attempts,
            Duration::from_millis(self.backoff_unit_ms),
        )
    }
}

/// Splits a space separated device list.
///
/// Empty fragments are dropped and repeated names are kept once, at their
/// first position.
pub fn parse_device_list(raw: &str) -> Vec<String> {
    let mut devices: Vec<String> = Vec::new();
    for device in raw.split_whitespace() {
        if !devices.iter().any(|known| known == device) {
            devices.push(device.to_string());
        }
    }
    devices
}
