use tokio::sync::mpsc;

/// Directory inside the container where allocated devices appear.
pub const CONTAINER_DEVICE_DIR: &str = "/tmp/device-plugin-socketcan";

/// A request to wire one device into the container that mounts
/// `container_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub device_id: String,
    pub container_path: String,
}

impl Allocation {
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let container_path = container_device_path(&device_id);
        Self {
            device_id,
            container_path,
        }
    }
}

/// Container-local path of the placeholder device for `device_id`.
pub fn container_device_path(device_id: &str) -> String {
    format!("{CONTAINER_DEVICE_DIR}/{device_id}")
}

pub type AllocationSender = mpsc::UnboundedSender<Allocation>;
pub type AllocationReceiver = mpsc::UnboundedReceiver<Allocation>;

/// Creates the queue between the gRPC handlers and the allocation worker.
///
/// The queue is unbounded so that enqueueing from `Allocate` never waits.
pub fn allocation_queue() -> (AllocationSender, AllocationReceiver) {
    mpsc::unbounded_channel()
}
