//! Lifecycle of all device plugins in the process.
//!
//! Kubelet wipes its device plugin directory when it restarts and then
//! re-creates `kubelet.sock`. The manager watches for that socket and brings
//! every plugin back: a fresh gRPC server on a fresh socket, followed by a new
//! registration. Allocation workers are untouched by this, so queued
//! allocations survive a kubelet restart.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::device_plugin::PluginContext;
use super::device_plugin::SocketCanDevicePlugin;
use super::registration::register_with_kubelet;
use crate::domain::lister::Lister;

/// A plugin together with its currently running gRPC server.
struct ManagedPlugin {
    kind: String,
    plugin: Arc<SocketCanDevicePlugin>,
    server: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ManagedPlugin {
    async fn stop_server(&mut self) {
        if let Some((token, handle)) = self.server.take() {
            token.cancel();
            if let Err(e) = handle.await {
                error!(kind = %self.kind, "device plugin server task failed: {e}");
            }
        }
    }
}

/// Serves and registers one device plugin per discovered resource kind.
pub struct PluginManager {
    lister: Lister,
    context: PluginContext,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
}

impl PluginManager {
    pub fn new(
        lister: Lister,
        context: PluginContext,
        plugin_dir: impl Into<PathBuf>,
        kubelet_socket: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lister,
            context,
            plugin_dir: plugin_dir.into(),
            kubelet_socket: kubelet_socket.into(),
        }
    }

    /// Socket path that kubelet dials for `kind`.
    pub fn socket_path(&self, kind: &str) -> PathBuf {
        self.plugin_dir.join(self.lister.endpoint(kind))
    }

    /// Runs every plugin until `cancellation_token` fires.
    ///
    /// Returns an error when a plugin cannot be started or served. A failed
    /// registration is only logged and retried on the next kubelet restart.
    #[tracing::instrument(skip_all, fields(namespace = %self.lister.resource_namespace()))]
    pub async fn run(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let kinds = self.lister.discover();
        if kinds.is_empty() {
            warn!("no SocketCAN devices configured, no resources will be advertised");
            cancellation_token.cancelled().await;
            return Ok(());
        }

        let mut plugins = Vec::with_capacity(kinds.len());
        let mut workers = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let plugin = self.lister.new_plugin(
                &kind,
                self.context.clone(),
                cancellation_token.child_token(),
            );
            let worker = plugin
                .start()
                .await
                .with_context(|| format!("failed to start device plugin {kind}"))?;
            workers.push(worker);
            plugins.push(ManagedPlugin {
                kind,
                plugin,
                server: None,
            });
        }

        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel();
        // dropping the watcher stops the notifications
        let _watcher = self.watch_kubelet_socket(restart_tx)?;

        let result = async {
            self.serve_and_register(&mut plugins, &cancellation_token)
                .await?;

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    Some(()) = restart_rx.recv() => {
                        info!("kubelet socket re-created, restarting device plugin servers");
                        self.serve_and_register(&mut plugins, &cancellation_token).await?;
                    }
                }
            }

            anyhow::Ok(())
        }
        .await;

        info!("stopping device plugins");
        cancellation_token.cancel();
        for managed in &mut plugins {
            managed.stop_server().await;
            remove_socket(&self.socket_path(&managed.kind));
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!("allocation worker task failed: {e}");
            }
        }

        result
    }

    /// (Re)starts the gRPC server of every plugin and registers it.
    async fn serve_and_register(
        &self,
        plugins: &mut [ManagedPlugin],
        cancellation_token: &CancellationToken,
    ) -> anyhow::Result<()> {
        for managed in plugins.iter_mut() {
            managed.stop_server().await;

            let socket_path = self.socket_path(&managed.kind);
            let server_token = cancellation_token.child_token();
            let handle = managed
                .plugin
                .serve(&socket_path, server_token.clone())
                .await
                .with_context(|| format!("failed to serve device plugin {}", managed.kind))?;
            managed.server = Some((server_token, handle));

            let resource_name = self.lister.resource_name(&managed.kind);
            if let Err(e) = register_with_kubelet(
                &self.kubelet_socket,
                &self.lister.endpoint(&managed.kind),
                &resource_name,
                SocketCanDevicePlugin::options(),
            )
            .await
            {
                error!(resource = %resource_name, "failed to register device plugin: {e:#}");
            }
        }

        Ok(())
    }

    /// Watches the kubelet socket directory and signals every re-creation of
    /// the kubelet socket on `restarts`.
    fn watch_kubelet_socket(
        &self,
        restarts: mpsc::UnboundedSender<()>,
    ) -> anyhow::Result<RecommendedWatcher> {
        let watch_dir = self
            .kubelet_socket
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let socket_name = self.kubelet_socket.file_name().map(ToOwned::to_owned);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let kubelet_created = matches!(event.kind, EventKind::Create(_))
                        && event
                            .paths
                            .iter()
                            .any(|path| path.file_name() == socket_name.as_deref());
                    if kubelet_created {
                        debug!("kubelet socket created: {:?}", event.paths);
                        // the manager may already be gone during shutdown
                        let _ = restarts.send(());
                    }
                }
                Err(e) => {
                    error!("device plugin directory watch error: {e:?}");
                }
            },
            Config::default(),
        )
        .context("failed to create kubelet socket watcher")?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", watch_dir.display()))?;

        Ok(watcher)
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove socket {}: {e}", path.display()),
    }
}
