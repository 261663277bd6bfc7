//! Abstract model of a pod on a host: one sandbox holding the network
//! namespace and IP, plus N application containers. The container engine
//! and overlay network are external collaborators; only their contracts
//! live here.

use async_trait::async_trait;
use std::net::IpAddr;

use cube_types::{ContainerSpec, ContainerState, Pod, Uid};

/// Container-engine failure; retried on the next level-triggered sync.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("engine: {0}")]
    Engine(String),

    #[error("overlay network: {0}")]
    Network(String),

    #[error("deadline exceeded while {0}")]
    Deadline(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Ready,
    NotReady,
}

#[derive(Clone, Debug)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub exit_code: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct SandboxStatus {
    pub id: String,
    pub pod_uid: Uid,
    pub state: SandboxState,
    pub ip: Option<IpAddr>,
}

/// Everything the engine knows about one pod right now.
#[derive(Clone, Debug, Default)]
pub struct PodRuntimeStatus {
    pub uid: Uid,
    pub containers: Vec<ContainerStatus>,
    pub sandboxes: Vec<SandboxStatus>,
}

impl PodRuntimeStatus {
    pub fn empty(uid: impl Into<Uid>) -> Self {
        Self {
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn find_container(&self, name: &str) -> Option<&ContainerStatus> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn sandbox(&self) -> Option<&SandboxStatus> {
        self.sandboxes.first()
    }

    pub fn sandbox_ip(&self) -> Option<IpAddr> {
        self.sandbox().and_then(|s| s.ip)
    }
}

/// Contract required of the container engine. The engine serializes its own
/// operations; callers need no lock around it.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create_sandbox(&self, pod: &Pod) -> Result<String, RuntimeError>;

    async fn create_container(
        &self,
        pod: &Pod,
        spec: &ContainerSpec,
        sandbox_id: &str,
    ) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pod_status(&self, uid: &str) -> Result<PodRuntimeStatus, RuntimeError>;
}

/// Contract for the overlay network a sandbox joins to obtain its pod IP.
#[async_trait]
pub trait OverlayNetwork: Send + Sync + 'static {
    async fn attach(&self, sandbox_id: &str) -> Result<IpAddr, RuntimeError>;

    async fn detach(&self, sandbox_id: &str) -> Result<(), RuntimeError>;
}
