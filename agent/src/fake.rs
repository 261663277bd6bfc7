//! In-process engine + overlay used by the test suites and the dev daemon.
//! Containers transition Created -> Running on start; tests can induce
//! exits and sandbox failures to drive the mediator's recovery paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use cube_types::{ApiObject, ContainerSpec, ContainerState, Pod, Uid};

use crate::runtime::{
    ContainerEngine, ContainerStatus, OverlayNetwork, PodRuntimeStatus, RuntimeError,
    SandboxState, SandboxStatus,
};

#[derive(Clone, Debug)]
struct ContainerRecord {
    pod_uid: Uid,
    name: String,
    state: ContainerState,
    exit_code: Option<i32>,
}

#[derive(Clone, Debug)]
struct SandboxRecord {
    pod_uid: Uid,
    state: SandboxState,
    ip: Option<IpAddr>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerRecord>,
    sandboxes: HashMap<String, SandboxRecord>,
    pulled: Vec<String>,
    broken_pods: HashSet<Uid>,
    next_id: u64,
    next_host: u32,
}

impl State {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::new(FakeEngine {
            state: self.state.clone(),
        })
    }

    pub fn network(&self) -> Arc<dyn OverlayNetwork> {
        Arc::new(FakeOverlay {
            state: self.state.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake runtime lock poisoned")
    }

    /// Simulate a container crash (or clean exit with code 0).
    pub fn exit_container(&self, pod_uid: &str, name: &str, code: i32) {
        let mut state = self.lock();
        for record in state.containers.values_mut() {
            if record.pod_uid == pod_uid && record.name == name {
                record.state = ContainerState::Exited;
                record.exit_code = Some(code);
            }
        }
    }

    /// Make every further container create for this pod fail, so a crash
    /// stays a crash instead of being healed on the next sync.
    pub fn fail_restarts(&self, pod_uid: &str) {
        self.lock().broken_pods.insert(pod_uid.to_string());
    }

    /// Simulate the sandbox dying underneath the pod.
    pub fn break_sandbox(&self, pod_uid: &str) {
        let mut state = self.lock();
        for record in state.sandboxes.values_mut() {
            if record.pod_uid == pod_uid {
                record.state = SandboxState::NotReady;
            }
        }
    }

    pub fn container_ids(&self, pod_uid: &str) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, r)| r.pod_uid == pod_uid)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }
}

struct FakeEngine {
    state: Arc<Mutex<State>>,
}

impl FakeEngine {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake runtime lock poisoned")
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create_sandbox(&self, pod: &Pod) -> Result<String, RuntimeError> {
        let mut state = self.lock();
        let id = state.fresh_id("sbx");
        state.sandboxes.insert(
            id.clone(),
            SandboxRecord {
                pod_uid: pod.uid().to_string(),
                state: SandboxState::Ready,
                ip: None,
            },
        );
        Ok(id)
    }

    async fn create_container(
        &self,
        pod: &Pod,
        spec: &ContainerSpec,
        sandbox_id: &str,
    ) -> Result<String, RuntimeError> {
        let mut state = self.lock();
        if state.broken_pods.contains(pod.uid()) {
            return Err(RuntimeError::Engine(format!(
                "container create rejected for pod {}",
                pod.uid()
            )));
        }
        if !state.sandboxes.contains_key(sandbox_id) {
            return Err(RuntimeError::Engine(format!(
                "sandbox {sandbox_id} does not exist"
            )));
        }
        // Creating under a taken name evicts the previous (stopped)
        // container, the way a name-keyed engine behaves.
        state
            .containers
            .retain(|_, r| !(r.pod_uid == pod.uid() && r.name == spec.name));
        let id = state.fresh_id("ctr");
        state.containers.insert(
            id.clone(),
            ContainerRecord {
                pod_uid: pod.uid().to_string(),
                name: spec.name.clone(),
                state: ContainerState::Created,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(record) => {
                record.state = ContainerState::Running;
                record.exit_code = None;
                Ok(())
            }
            None => Err(RuntimeError::Engine(format!("no container {id}"))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if let Some(record) = state.containers.get_mut(id) {
            if record.state == ContainerState::Running {
                record.state = ContainerState::Exited;
                record.exit_code = Some(0);
            }
            return Ok(());
        }
        if let Some(record) = state.sandboxes.get_mut(id) {
            record.state = SandboxState::NotReady;
            return Ok(());
        }
        // Stopping something already gone keeps teardown idempotent.
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.containers.remove(id);
        state.sandboxes.remove(id);
        Ok(())
    }

    async fn pod_status(&self, uid: &str) -> Result<PodRuntimeStatus, RuntimeError> {
        let state = self.lock();
        let mut containers: Vec<ContainerStatus> = state
            .containers
            .iter()
            .filter(|(_, r)| r.pod_uid == uid)
            .map(|(id, r)| ContainerStatus {
                id: id.clone(),
                name: r.name.clone(),
                state: r.state,
                exit_code: r.exit_code,
            })
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut sandboxes: Vec<SandboxStatus> = state
            .sandboxes
            .iter()
            .filter(|(_, r)| r.pod_uid == uid)
            .map(|(id, r)| SandboxStatus {
                id: id.clone(),
                pod_uid: r.pod_uid.clone(),
                state: r.state,
                ip: r.ip,
            })
            .collect();
        sandboxes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(PodRuntimeStatus {
            uid: uid.to_string(),
            containers,
            sandboxes,
        })
    }
}

struct FakeOverlay {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl OverlayNetwork for FakeOverlay {
    async fn attach(&self, sandbox_id: &str) -> Result<IpAddr, RuntimeError> {
        let mut state = self.state.lock().expect("fake runtime lock poisoned");
        state.next_host += 1;
        let host = state.next_host;
        let Some(record) = state.sandboxes.get_mut(sandbox_id) else {
            return Err(RuntimeError::Network(format!(
                "sandbox {sandbox_id} not attachable"
            )));
        };
        if let Some(ip) = record.ip {
            return Ok(ip);
        }
        let ip = IpAddr::V4(Ipv4Addr::new(10, 44, (host >> 8) as u8, (host & 0xff) as u8));
        record.ip = Some(ip);
        Ok(ip)
    }

    async fn detach(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("fake runtime lock poisoned");
        if let Some(record) = state.sandboxes.get_mut(sandbox_id) {
            record.ip = None;
        }
        Ok(())
    }
}
