use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonArgs;
use crate::domain::lister::Lister;
use crate::platform::k8s::PluginContext;
use crate::platform::k8s::PluginManager;
use crate::platform::network::ShellCommandRunner;
use crate::platform::runtime::build_resolver;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Application core structure, owning the daemon configuration
pub struct Application {
    daemon_args: DaemonArgs,
    cancellation_token: CancellationToken,
}

impl Application {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self {
            daemon_args,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Builds the plugin manager from the configuration.
    pub fn plugin_manager(&self) -> PluginManager {
        let args = &self.daemon_args;
        let devices = args.device_names();
        tracing::info!(?devices, "configured SocketCAN devices");

        let context = PluginContext {
            fake_device_path: args.fake_device_path.clone(),
            resolver: build_resolver(
                args.container_runtime,
                args.docker_socket.clone(),
                args.proc_root.clone(),
            ),
            runner: Arc::new(ShellCommandRunner),
            policy: args.provision_policy,
            backoff: args.backoff(),
        };

        PluginManager::new(
            Lister::from_devices(args.resource_namespace.clone(), &devices),
            context,
            args.device_plugin_dir.clone(),
            args.kubelet_socket.clone(),
        )
    }

    /// Run application until a shutdown signal arrives or the plugins fail
    pub async fn run(&self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs the plugins until `shutdown` resolves.
    ///
    /// The plugins are stopped and joined even when `shutdown` fails.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        tracing::info!("Starting all application tasks...");

        let manager = self.plugin_manager();
        let token = self.cancellation_token.clone();
        let mut manager_task = tokio::spawn(async move { manager.run(token).await });

        tokio::select! {
            signal = shutdown => {
                if let Err(e) = &signal {
                    tracing::error!("Shutdown signal handling failed: {e:#}");
                } else {
                    tracing::info!("Shutdown signal received, cancelling all tasks");
                }
                self.cancellation_token.cancel();

                match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut manager_task).await {
                    Ok(joined) => joined.context("device plugin task panicked")??,
                    Err(_) => {
                        tracing::warn!("Task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
                        manager_task.abort();
                    }
                }
                signal?;
            }
            joined = &mut manager_task => {
                let result = joined.context("device plugin task panicked")?;
                if let Err(e) = &result {
                    tracing::error!("Device plugins stopped with error: {e:#}");
                }
                result?;
                tracing::warn!("Device plugins stopped unexpectedly");
            }
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }

    Ok(())
}
