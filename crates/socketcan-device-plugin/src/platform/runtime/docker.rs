//! Docker Engine API backend.

use std::path::PathBuf;

use http_body_util::BodyExt;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header;
use hyper::Method;
use hyper::Request;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::UnixStream;
use tracing::debug;

use super::ContainerResolver;
use super::ResolveError;

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    #[serde(default)]
    state: Option<ContainerState>,
    #[serde(default)]
    host_config: Option<HostConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    pid: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(default)]
    devices: Option<Vec<DeviceMapping>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceMapping {
    #[serde(default)]
    path_in_container: String,
}

impl ContainerInspect {
    fn has_device(&self, container_path: &str) -> bool {
        self.host_config
            .as_ref()
            .and_then(|config| config.devices.as_ref())
            .is_some_and(|devices| {
                devices
                    .iter()
                    .any(|device| device.path_in_container == container_path)
            })
    }

    fn running_pid(&self) -> Result<u32, ResolveError> {
        match &self.state {
            Some(state) if state.running && state.pid > 0 => Ok(state.pid),
            _ => Err(ResolveError::NotRunning(self.id.clone())),
        }
    }
}

/// Resolves containers through the Docker Engine API on a unix socket.
#[derive(Debug, Clone)]
pub struct DockerResolver {
    socket_path: PathBuf,
}

impl DockerResolver {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Issues a GET request and returns status and body.
    async fn get(&self, path: &str) -> Result<(StatusCode, Bytes), ResolveError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ResolveError::Unavailable(format!("{}: {e}", self.socket_path.display()))
        })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ResolveError::Unavailable(format!("handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("docker connection closed with error: {e}");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ResolveError::Protocol(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ResolveError::Unavailable(format!("GET {path} failed: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ResolveError::Protocol(format!("reading GET {path} body: {e}")))?
            .to_bytes();

        Ok((status, body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ResolveError> {
        let (status, body) = self.get(path).await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(ResolveError::Protocol(format!(
                "GET {path} returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| ResolveError::Protocol(format!("decoding GET {path}: {e}")))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspect, ResolveError> {
        self.get_json(&format!("/containers/{container_id}/json"))
            .await
    }
}

#[tonic::async_trait]
impl ContainerResolver for DockerResolver {
    async fn connect(&self) -> Result<(), ResolveError> {
        let (status, _) = self.get("/_ping").await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(ResolveError::Unavailable(format!("ping returned {status}")))
        }
    }

    async fn container_id_by_device_path(
        &self,
        container_path: &str,
    ) -> Result<String, ResolveError> {
        let containers: Vec<ContainerSummary> = self.get_json("/containers/json").await?;

        for summary in containers {
            let inspect = match self.inspect(&summary.id).await {
                Ok(inspect) => inspect,
                // the container went away between list and inspect
                Err(ResolveError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            if inspect.has_device(container_path) {
                return Ok(inspect.id);
            }
        }

        Err(ResolveError::NotFound(container_path.to_string()))
    }

    async fn pid_by_container_id(&self, container_id: &str) -> Result<u32, ResolveError> {
        self.inspect(container_id).await?.running_pid()
    }
}
