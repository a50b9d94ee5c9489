//! Device catalog.
//!
//! Turns the configured CAN interface names into resource kinds and creates
//! one device plugin per kind.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::platform::k8s::device_plugin::PluginContext;
use crate::platform::k8s::device_plugin::SocketCanDevicePlugin;

/// Default namespace under which resources are registered with kubelet.
pub const DEFAULT_RESOURCE_NAMESPACE: &str = "socketcan.generals.space";

/// Prefix that turns a device name into a resource kind.
pub const RESOURCE_KIND_PREFIX: &str = "socketcan-";

/// Builds the resource kind for `device`, e.g. `socketcan-can0`.
pub fn resource_kind(device: &str) -> String {
    format!("{RESOURCE_KIND_PREFIX}{device}")
}

/// Recovers the device name from a resource kind.
pub fn device_name(kind: &str) -> &str {
    kind.strip_prefix(RESOURCE_KIND_PREFIX).unwrap_or(kind)
}

/// Enumerates the configured devices as plugin resources.
#[derive(Debug, Clone)]
pub struct Lister {
    resource_namespace: String,
    kinds: Vec<String>,
}

impl Lister {
    /// Creates a lister over already prefixed resource kinds.
    pub fn new(resource_namespace: impl Into<String>, kinds: Vec<String>) -> Self {
        Self {
            resource_namespace: resource_namespace.into(),
            kinds,
        }
    }

    /// Creates a lister from bare device names.
    pub fn from_devices(resource_namespace: impl Into<String>, devices: &[String]) -> Self {
        Self::new(
            resource_namespace,
            devices.iter().map(|device| resource_kind(device)).collect(),
        )
    }

    pub fn resource_namespace(&self) -> &str {
        &self.resource_namespace
    }

    /// Resource kinds to serve. No configured devices yields an empty list.
    pub fn discover(&self) -> Vec<String> {
        self.kinds.clone()
    }

    /// Fully qualified resource name registered with kubelet.
    pub fn resource_name(&self, kind: &str) -> String {
        format!("{}/{kind}", self.resource_namespace)
    }

    /// Plugin socket file name inside the kubelet device plugin directory.
    pub fn endpoint(&self, kind: &str) -> String {
        format!("{}_{kind}.sock", self.resource_namespace)
    }

    /// Creates the device plugin for `kind`.
    pub fn new_plugin(
        &self,
        kind: &str,
        context: PluginContext,
        cancellation_token: CancellationToken,
    ) -> Arc<SocketCanDevicePlugin> {
        debug!(kind, "creating device plugin");
        SocketCanDevicePlugin::new(device_name(kind).to_string(), context, cancellation_token)
    }
}
