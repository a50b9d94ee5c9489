#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::DeviceSpec;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::allocation::allocation_queue;
use crate::domain::allocation::container_device_path;
use crate::domain::allocation::Allocation;
use crate::domain::allocation::AllocationReceiver;
use crate::domain::allocation::AllocationSender;
use crate::domain::worker::AllocationWorker;
use crate::domain::worker::Backoff;
use crate::platform::fake_device::ensure_fake_device;
use crate::platform::network::CommandRunner;
use crate::platform::network::NetworkProvisioner;
use crate::platform::network::ProvisionPolicy;
use crate::platform::runtime::ContainerResolver;

/// Health value reported for every device.
pub const HEALTHY: &str = "Healthy";

/// Read-only cgroup permission for the placeholder device.
pub const DEVICE_PERMISSIONS: &str = "r";

/// Dependencies shared by every device plugin instance.
#[derive(Clone)]
pub struct PluginContext {
    /// host path of the placeholder device handed to kubelet
    pub fake_device_path: PathBuf,
    pub resolver: Arc<dyn ContainerResolver>,
    pub runner: Arc<dyn CommandRunner>,
    pub policy: ProvisionPolicy,
    pub backoff: Backoff,
}

/// SocketCAN device plugin for one CAN interface
pub struct SocketCanDevicePlugin {
    device_name: String,
    context: PluginContext,
    /// producer side of the allocation queue, fed by `Allocate`
    allocations: AllocationSender,
    /// consumer side, handed to the worker on `start`
    pending_receiver: Mutex<Option<AllocationReceiver>>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for SocketCanDevicePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanDevicePlugin")
            .field("device_name", &self.device_name)
            .field("fake_device_path", &self.context.fake_device_path)
            .finish_non_exhaustive()
    }
}

impl SocketCanDevicePlugin {
    /// create a new device plugin bound to `device_name`
    pub fn new(
        device_name: String,
        context: PluginContext,
        cancellation_token: CancellationToken,
    ) -> Arc<Self> {
        let (allocations, receiver) = allocation_queue();

        Arc::new(Self {
            device_name,
            context,
            allocations,
            pending_receiver: Mutex::new(Some(receiver)),
            cancellation_token,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn options() -> DevicePluginOptions {
        DevicePluginOptions::default()
    }

    /// Prepares the plugin and launches its allocation worker.
    ///
    /// Fails when the fake device cannot be created or the container runtime
    /// is unreachable; the caller is expected to terminate the process.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        info!(device = %self.device_name, "starting device plugin");

        let runner = self.context.runner.clone();
        let fake_device_path = self.context.fake_device_path.clone();
        tokio::task::spawn_blocking(move || ensure_fake_device(&fake_device_path, runner.as_ref()))
            .await
            .context("fake device task panicked")?
            .context("failed to create fake device")?;

        self.context
            .resolver
            .connect()
            .await
            .context("failed to connect to container runtime")?;

        let receiver = self
            .pending_receiver
            .lock()
            .map_err(|_| anyhow::anyhow!("allocation queue lock poisoned"))?
            .take()
            .with_context(|| format!("device plugin {} already started", self.device_name))?;

        let worker = AllocationWorker::new(
            self.device_name.clone(),
            receiver,
            self.context.resolver.clone(),
            Arc::new(NetworkProvisioner::new(
                self.context.runner.clone(),
                self.context.policy,
            )),
            self.context.backoff,
        );

        let token = self.cancellation_token.clone();
        Ok(tokio::spawn(worker.run(token)))
    }

    /// start the gRPC server on `socket_path`
    ///
    /// The server stops when `server_token` is cancelled.
    pub async fn serve(
        self: &Arc<Self>,
        socket_path: &Path,
        server_token: CancellationToken,
    ) -> anyhow::Result<JoinHandle<()>> {
        info!(device = %self.device_name, "start device plugin server: {}", socket_path.display());

        // clean up old socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        let service = DevicePluginService::new(self.clone(), server_token.clone());
        let device_name = self.device_name.clone();

        Ok(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        server_token.cancelled().await;
                        info!(device = %device_name, "shutting down gRPC server");
                    },
                )
                .await;

            if let Err(e) = result {
                error!("device plugin gRPC server failed: {e}");
            }
        }))
    }

    /// Builds the allocate response and enqueues one allocation per device ID.
    ///
    /// Never waits for provisioning.
    pub fn allocate_devices(&self, request: AllocateRequest) -> AllocateResponse {
        let mut container_responses = Vec::with_capacity(request.container_requests.len());

        for container_request in request.container_requests {
            let mut devices = Vec::with_capacity(container_request.devices_ids.len());

            for device_id in container_request.devices_ids {
                let container_path = container_device_path(&device_id);
                devices.push(DeviceSpec {
                    container_path: container_path.clone(),
                    host_path: self.context.fake_device_path.display().to_string(),
                    permissions: DEVICE_PERMISSIONS.to_string(),
                });

                let allocation = Allocation {
                    device_id,
                    container_path,
                };
                if let Err(e) = self.allocations.send(allocation) {
                    warn!(
                        device = %self.device_name,
                        "allocation worker is gone, dropping allocation for {}",
                        e.0.device_id
                    );
                }
            }

            container_responses.push(ContainerAllocateResponse {
                devices,
                ..Default::default()
            });
        }

        AllocateResponse {
            container_responses,
        }
    }

    fn device_list(&self) -> ListAndWatchResponse {
        ListAndWatchResponse {
            devices: vec![api::Device {
                id: self.device_name.clone(),
                health: HEALTHY.to_string(),
                topology: None,
            }],
        }
    }
}

/// DevicePlugin service implementation
#[derive(Debug)]
pub struct DevicePluginService {
    device_plugin: Arc<SocketCanDevicePlugin>,
    /// ends open ListAndWatch streams when the server stops
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        device_plugin: Arc<SocketCanDevicePlugin>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            device_plugin,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(SocketCanDevicePlugin::options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// report the device once, then keep the stream open
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let device_name = self.device_plugin.device_name.clone();
        info!(device = %device_name, "starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let initial_response = self.device_plugin.device_list();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            if let Err(e) = tx.send(Ok(initial_response)) {
                error!("failed to send initial device list: {}", e);
                return;
            }

            // health is never re-evaluated; park until the stream goes away
            tokio::select! {
                _ = cancellation_token.cancelled() => {}
                _ = tx.closed() => {}
            }
            info!(device = %device_name, "device watch task stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.into_inner());
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    /// allocate devices to container
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!(device = %self.device_plugin.device_name, "allocating devices to containers: {:?}", req);

        Ok(Response::new(self.device_plugin.allocate_devices(req)))
    }

    /// pre-start container
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
