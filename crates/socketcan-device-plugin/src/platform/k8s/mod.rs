pub mod device_plugin;
pub mod manager;
pub mod registration;

pub use device_plugin::PluginContext;
pub use device_plugin::SocketCanDevicePlugin;
pub use manager::PluginManager;
