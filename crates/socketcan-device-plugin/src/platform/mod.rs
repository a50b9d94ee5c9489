pub mod fake_device;
pub mod k8s;
pub mod network;
pub mod runtime;
