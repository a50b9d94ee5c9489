//! Placeholder block device handed to kubelet as the allocated device.
//!
//! Kubelet requires every allocation to reference a host device node. The CAN
//! link itself is provisioned separately, so one shared dummy node is enough.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::debug;
use tracing::info;

use super::network::CommandError;
use super::network::CommandRunner;

/// Default host path of the placeholder device.
pub const FAKE_DEVICE_HOST_PATH: &str = "/var/run/device-plugin-socketcan-fakedev";

#[derive(Debug, Error)]
pub enum FakeDeviceError {
    #[error("failed to inspect fake device {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create fake device {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: CommandError,
    },
}

/// Creates the placeholder block device at `path` unless it already exists.
pub fn ensure_fake_device(path: &Path, runner: &dyn CommandRunner) -> Result<(), FakeDeviceError> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => {
            debug!(path = %path.display(), "fake device already exists");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "creating fake device");
            runner
                .run(&format!("mknod {} b 1 1", path.display()))
                .map(|_| ())
                .map_err(|source| FakeDeviceError::Create {
                    path: path.display().to_string(),
                    source,
                })
        }
        Err(source) => Err(FakeDeviceError::Stat {
            path: path.display().to_string(),
            source,
        }),
    }
}
