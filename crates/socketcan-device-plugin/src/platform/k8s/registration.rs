use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::info;

use super::device_plugin::api::registration_client::RegistrationClient;
use super::device_plugin::api::DevicePluginOptions;
use super::device_plugin::api::RegisterRequest;

/// Device plugin API version announced to kubelet.
pub const API_VERSION: &str = "v1beta1";

/// register a device plugin endpoint with kubelet
///
/// `endpoint` is the socket file name relative to the device plugin directory.
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    options: DevicePluginOptions,
) -> anyhow::Result<()> {
    info!(
        resource = resource_name,
        "registering device plugin with kubelet: {}",
        kubelet_socket.display()
    );

    let channel = create_uds_channel(kubelet_socket)
        .await
        .with_context(|| format!("failed to connect to kubelet at {}", kubelet_socket.display()))?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(options),
    };

    match client.register(Request::new(request)).await {
        Ok(_) => {
            info!(resource = resource_name, "successfully registered device plugin with kubelet");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("registration of {resource_name} failed: {e}")),
    }
}

/// create Unix Domain Socket client connection
pub async fn create_uds_channel(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path: PathBuf = socket_path.to_path_buf();

    // the URL is a placeholder, the connector always dials the socket
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;
    use tonic::Response;
    use tonic::Status;

    use super::*;
    use crate::platform::k8s::device_plugin::api::registration_server::Registration;
    use crate::platform::k8s::device_plugin::api::registration_server::RegistrationServer;
    use crate::platform::k8s::device_plugin::api::Empty;

    /// In-process kubelet registration service that records requests.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeKubelet {
        pub(crate) requests: Arc<Mutex<Vec<RegisterRequest>>>,
    }

    impl FakeKubelet {
        pub(crate) fn registered(&self) -> Vec<RegisterRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// Serves the registration service on `socket_path` until `token` fires.
        pub(crate) fn serve(&self, socket_path: &Path, token: CancellationToken) {
            let _ = std::fs::remove_file(socket_path);
            let listener = UnixListener::bind(socket_path).expect("bind fake kubelet");
            let service = RegistrationServer::new(self.clone());
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(
                        tokio_stream::wrappers::UnixListenerStream::new(listener),
                        token.cancelled_owned(),
                    )
                    .await
                    .expect("fake kubelet server");
            });
        }
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<Empty>, Status> {
            self.requests.lock().unwrap().push(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }
}
