use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use similar_asserts::assert_eq;
use socketcan_device_plugin::api::device_plugin_client::DevicePluginClient;
use socketcan_device_plugin::api::AllocateRequest;
use socketcan_device_plugin::api::ContainerAllocateRequest;
use socketcan_device_plugin::api::DeviceSpec;
use socketcan_device_plugin::api::Empty;
use socketcan_device_plugin::domain::worker::Backoff;
use socketcan_device_plugin::k8s::registration::create_uds_channel;
use socketcan_device_plugin::k8s::PluginContext;
use socketcan_device_plugin::k8s::SocketCanDevicePlugin;
use socketcan_device_plugin::platform::network::CommandError;
use socketcan_device_plugin::platform::network::CommandRunner;
use socketcan_device_plugin::platform::network::ProvisionPolicy;
use socketcan_device_plugin::platform::runtime::ContainerResolver;
use socketcan_device_plugin::platform::runtime::ResolveError;
use test_log::test;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const CONTAINER_ID: &str = "4f66ad9a0b2e4d1c9f5b8a7e6d3c2b1a0f9e8d7c6b5a4f3e2d1c0b9a8f7e6d5c";

/// A single running container that mounted the can0 placeholder.
struct OneContainer;

#[tonic::async_trait]
impl ContainerResolver for OneContainer {
    async fn connect(&self) -> Result<(), ResolveError> {
        Ok(())
    }

    async fn container_id_by_device_path(&self, path: &str) -> Result<String, ResolveError> {
        if path == "/tmp/device-plugin-socketcan/can0" {
            Ok(CONTAINER_ID.to_string())
        } else {
            Err(ResolveError::NotFound(path.to_string()))
        }
    }

    async fn pid_by_container_id(&self, id: &str) -> Result<u32, ResolveError> {
        if id == CONTAINER_ID {
            Ok(4242)
        } else {
            Err(ResolveError::NotFound(id.to_string()))
        }
    }
}

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<String>>,
}

impl Recorder {
    fn recorded(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for Recorder {
    fn run(&self, command: &str) -> Result<String, CommandError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(String::new())
    }
}

/// Blocks on the first command until released or the release side drops.
struct HangingRunner {
    commands: Mutex<Vec<String>>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl CommandRunner for HangingRunner {
    fn run(&self, command: &str) -> Result<String, CommandError> {
        let first = {
            let mut commands = self.commands.lock().unwrap();
            commands.push(command.to_string());
            commands.len() == 1
        };
        if first {
            let _ = self.release.lock().unwrap().recv();
        }
        Ok(String::new())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    socket_path: PathBuf,
    fake_device_path: PathBuf,
    token: CancellationToken,
}

async fn serve_can0(runner: Arc<dyn CommandRunner>) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("socketcan.generals.space_socketcan-can0.sock");
    let fake_device_path = dir.path().join("fakedev");
    std::fs::write(&fake_device_path, b"").expect("precreate fake device");
    let token = CancellationToken::new();

    let plugin = SocketCanDevicePlugin::new(
        "can0".to_string(),
        PluginContext {
            fake_device_path: fake_device_path.clone(),
            resolver: Arc::new(OneContainer),
            runner,
            policy: ProvisionPolicy::AllSteps,
            backoff: Backoff::new(3, Duration::from_millis(10)),
        },
        token.clone(),
    );
    plugin.start().await.expect("plugin starts");
    plugin
        .serve(&socket_path, token.child_token())
        .await
        .expect("plugin serves");

    Fixture {
        _dir: dir,
        socket_path,
        fake_device_path,
        token,
    }
}

#[test(tokio::test)]
async fn list_and_watch_advertises_one_healthy_device() {
    let fixture = serve_can0(Arc::new(Recorder::default())).await;
    let channel = create_uds_channel(&fixture.socket_path)
        .await
        .expect("connect to plugin");
    let mut client = DevicePluginClient::new(channel);

    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list and watch")
        .into_inner();
    let first = stream
        .next()
        .await
        .expect("initial device list")
        .expect("ok response");

    assert_eq!(first.devices.len(), 1);
    assert_eq!(first.devices[0].id.as_str(), "can0");
    assert_eq!(first.devices[0].health.as_str(), "Healthy");

    fixture.token.cancel();
}

#[test(tokio::test)]
async fn allocate_returns_device_specs_and_provisions_in_background() {
    let recorder = Arc::new(Recorder::default());
    let fixture = serve_can0(recorder.clone()).await;
    let channel = create_uds_channel(&fixture.socket_path)
        .await
        .expect("connect to plugin");
    let mut client = DevicePluginClient::new(channel);

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["can0".to_string()],
            }],
        })
        .await
        .expect("allocate")
        .into_inner();

    assert_eq!(
        response.container_responses[0].devices,
        vec![DeviceSpec {
            container_path: "/tmp/device-plugin-socketcan/can0".to_string(),
            host_path: fixture.fake_device_path.display().to_string(),
            permissions: "r".to_string(),
        }]
    );

    let commands = timeout(Duration::from_secs(5), async {
        loop {
            let recorded = recorder.recorded();
            if recorded.len() >= 7 {
                return recorded;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("provisioning runs after allocate returned");

    assert_eq!(
        commands.first().map(String::as_str),
        Some("ip link add vxcan0_4242_1 type vxcan peer name vxcan0_42420_1")
    );
    assert_eq!(
        commands.last().map(String::as_str),
        Some("cangw -A -s vxcan0_4242_1 -d can0 -e")
    );

    fixture.token.cancel();
}

fn allocate_can0() -> AllocateRequest {
    AllocateRequest {
        container_requests: vec![ContainerAllocateRequest {
            devices_ids: vec!["can0".to_string()],
        }],
    }
}

#[test(tokio::test)]
async fn allocate_answers_while_provisioning_hangs() {
    let (release, gate) = std::sync::mpsc::channel();
    let runner = Arc::new(HangingRunner {
        commands: Mutex::new(Vec::new()),
        release: Mutex::new(gate),
    });
    let fixture = serve_can0(runner.clone()).await;
    let channel = create_uds_channel(&fixture.socket_path)
        .await
        .expect("connect to plugin");
    let mut client = DevicePluginClient::new(channel);

    client.allocate(allocate_can0()).await.expect("first allocate");
    timeout(Duration::from_secs(5), async {
        while runner.commands.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("provisioning starts and hangs");

    let response = timeout(Duration::from_secs(2), client.allocate(allocate_can0()))
        .await
        .expect("allocate does not wait for the hung command")
        .expect("second allocate")
        .into_inner();
    assert_eq!(response.container_responses.len(), 1);
    assert_eq!(runner.commands.lock().unwrap().len(), 1);

    release.send(()).expect("runner is waiting");
    timeout(Duration::from_secs(5), async {
        while runner.commands.lock().unwrap().len() < 14 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both allocations are provisioned after release");

    fixture.token.cancel();
}

