pub mod command;
pub mod provisioner;

pub use command::CommandError;
pub use command::CommandRunner;
pub use command::ShellCommandRunner;
pub use provisioner::NetworkProvisioner;
pub use provisioner::ProvisionError;
pub use provisioner::ProvisionPolicy;
pub use provisioner::ProvisionStep;
