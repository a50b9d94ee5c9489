use anyhow::Result;
use clap::Parser;
use socketcan_device_plugin::app::Application;
use socketcan_device_plugin::config::Cli;
use socketcan_device_plugin::config::Commands;
use socketcan_device_plugin::config::DaemonArgs;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    utils::logging::init();

    tracing::info!("Starting SocketCAN device plugin {}", &**version::VERSION);

    let app = Application::new(daemon_args);
    app.run().await
}
