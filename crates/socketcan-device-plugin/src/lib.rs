pub mod app;
pub mod config;
pub mod domain;
pub mod platform;

// Re-export main modules
pub use domain::allocation;
pub use domain::lister;
pub use domain::worker;
pub use platform::k8s;
pub use platform::k8s::device_plugin::api;
