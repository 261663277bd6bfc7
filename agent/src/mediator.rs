//! Pod-level action planning and enactment against the container engine.
//! `compute_pod_actions` is pure; `RuntimeMediator` enacts a plan step by
//! step and aborts on the first failure, leaving the rest to the next
//! level-triggered pass.

use std::sync::Arc;
use std::time::Duration;

use cube_types::{ApiObject, ContainerState, Pod};

use crate::runtime::{
    ContainerEngine, OverlayNetwork, PodRuntimeStatus, RuntimeError, SandboxState,
};

const IMAGE_PULL_DEADLINE: Duration = Duration::from_secs(120);
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodActions {
    pub kill_pod: bool,
    pub create_sandbox: bool,
    /// Existing sandbox id, if any.
    pub sandbox_id: Option<String>,
    /// Indices into `pod.spec.containers` to create and start.
    pub containers_to_start: Vec<usize>,
    /// Ids of observed containers to stop first.
    pub containers_to_kill: Vec<String>,
}

impl PodActions {
    pub fn is_noop(&self) -> bool {
        !self.kill_pod
            && !self.create_sandbox
            && self.containers_to_start.is_empty()
            && self.containers_to_kill.is_empty()
    }
}

/// The sandbox must be replaced when there is none, it is not ready, or it
/// never obtained an IP. Returns the existing sandbox id alongside.
fn sandbox_changed(observed: &PodRuntimeStatus) -> (bool, Option<String>) {
    let Some(sandbox) = observed.sandbox() else {
        return (true, None);
    };
    let id = Some(sandbox.id.clone());
    if sandbox.state != SandboxState::Ready || sandbox.ip.is_none() {
        return (true, id);
    }
    (false, id)
}

pub fn compute_pod_actions(pod: &Pod, observed: &PodRuntimeStatus) -> PodActions {
    let (changed, sandbox_id) = sandbox_changed(observed);
    if changed {
        let containers_to_start: Vec<usize> = (0..pod.spec.containers.len()).collect();
        return PodActions {
            kill_pod: true,
            // Nothing to run means no reason to stand a sandbox up.
            create_sandbox: !containers_to_start.is_empty(),
            sandbox_id,
            containers_to_kill: observed.containers.iter().map(|c| c.id.clone()).collect(),
            containers_to_start,
        };
    }

    let mut actions = PodActions {
        sandbox_id,
        ..Default::default()
    };
    for (idx, spec) in pod.spec.containers.iter().enumerate() {
        match observed.find_container(&spec.name) {
            None => actions.containers_to_start.push(idx),
            Some(status) if status.state != ContainerState::Running => {
                actions.containers_to_start.push(idx);
                if status.state == ContainerState::Unknown {
                    actions.containers_to_kill.push(status.id.clone());
                }
            }
            Some(_) => {}
        }
    }
    actions
}

pub struct RuntimeMediator {
    engine: Arc<dyn ContainerEngine>,
    network: Arc<dyn OverlayNetwork>,
}

impl RuntimeMediator {
    pub fn new(engine: Arc<dyn ContainerEngine>, network: Arc<dyn OverlayNetwork>) -> Self {
        Self { engine, network }
    }

    /// Inspect the engine's view of a pod, under the introspection deadline.
    pub async fn observed(&self, uid: &str) -> Result<PodRuntimeStatus, RuntimeError> {
        tokio::time::timeout(PROBE_DEADLINE, self.engine.pod_status(uid))
            .await
            .map_err(|_| RuntimeError::Deadline("inspecting pod"))?
    }

    /// Drive observed toward desired. Any failing step aborts the pass with
    /// an error; the caller retries on its next sync.
    pub async fn sync_pod(
        &self,
        pod: &Pod,
        observed: &PodRuntimeStatus,
    ) -> Result<(), RuntimeError> {
        let actions = compute_pod_actions(pod, observed);
        if actions.is_noop() {
            return Ok(());
        }
        tracing::info!(
            pod = %pod.name(),
            kill_pod = actions.kill_pod,
            create_sandbox = actions.create_sandbox,
            start = actions.containers_to_start.len(),
            kill = actions.containers_to_kill.len(),
            "syncing pod"
        );

        if actions.kill_pod {
            self.tear_down(observed, true).await?;
        } else {
            for id in &actions.containers_to_kill {
                self.engine.stop_container(id).await?;
            }
        }

        let mut sandbox_id = if actions.kill_pod {
            None
        } else {
            actions.sandbox_id.clone()
        };
        if actions.create_sandbox {
            let id = self.engine.create_sandbox(pod).await?;
            let ip = self.network.attach(&id).await?;
            tracing::info!(pod = %pod.name(), sandbox = %id, %ip, "sandbox up");
            sandbox_id = Some(id);
        }

        if actions.containers_to_start.is_empty() {
            return Ok(());
        }
        let Some(sandbox_id) = sandbox_id else {
            return Err(RuntimeError::Engine(format!(
                "no sandbox to attach containers of pod {}",
                pod.uid()
            )));
        };
        for idx in actions.containers_to_start {
            let spec = &pod.spec.containers[idx];
            tokio::time::timeout(IMAGE_PULL_DEADLINE, self.engine.pull_image(&spec.image))
                .await
                .map_err(|_| RuntimeError::Deadline("pulling image"))??;
            let id = self.engine.create_container(pod, spec, &sandbox_id).await?;
            self.engine.start_container(&id).await?;
            tracing::info!(pod = %pod.name(), container = %spec.name, "container started");
        }
        Ok(())
    }

    /// Remove every trace of a pod from the host. Idempotent; failures are
    /// logged and swallowed, the next pass retries.
    pub async fn kill_pod(&self, uid: &str) {
        let observed = match self.observed(uid).await {
            Ok(observed) => observed,
            Err(err) => {
                tracing::warn!(%uid, %err, "could not inspect pod before kill");
                return;
            }
        };
        if let Err(err) = self.tear_down(&observed, true).await {
            tracing::warn!(%uid, %err, "pod teardown incomplete");
        }
    }

    async fn tear_down(
        &self,
        observed: &PodRuntimeStatus,
        remove: bool,
    ) -> Result<(), RuntimeError> {
        for container in &observed.containers {
            self.engine.stop_container(&container.id).await?;
            if remove {
                self.engine.remove_container(&container.id).await?;
            }
        }
        for sandbox in &observed.sandboxes {
            self.engine.stop_container(&sandbox.id).await?;
            self.network.detach(&sandbox.id).await?;
            if remove {
                self.engine.remove_container(&sandbox.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRuntime;
    use crate::runtime::{ContainerStatus, SandboxStatus};
    use cube_types::{ContainerSpec, ObjectMeta, PodSpec};

    fn pod_with_containers(names: &[&str]) -> Pod {
        Pod {
            meta: ObjectMeta {
                name: "web-x1".into(),
                uid: "u-1".into(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: names
                    .iter()
                    .map(|n| ContainerSpec {
                        name: n.to_string(),
                        image: format!("img/{n}:1"),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn ready_sandbox() -> SandboxStatus {
        SandboxStatus {
            id: "sbx-1".into(),
            pod_uid: "u-1".into(),
            state: SandboxState::Ready,
            ip: Some("10.44.0.2".parse().unwrap()),
        }
    }

    fn container(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            id: format!("c-{name}"),
            name: name.into(),
            state,
            exit_code: None,
        }
    }

    #[test]
    fn fresh_pod_gets_sandbox_and_all_containers() {
        let pod = pod_with_containers(&["a", "b"]);
        let actions = compute_pod_actions(&pod, &PodRuntimeStatus::empty("u-1"));
        assert!(actions.kill_pod);
        assert!(actions.create_sandbox);
        assert_eq!(actions.containers_to_start, vec![0, 1]);
        assert!(actions.containers_to_kill.is_empty());
    }

    #[test]
    fn exited_container_restarts_without_touching_sandbox() {
        let pod = pod_with_containers(&["a", "b"]);
        let observed = PodRuntimeStatus {
            uid: "u-1".into(),
            containers: vec![
                container("a", ContainerState::Running),
                container("b", ContainerState::Exited),
            ],
            sandboxes: vec![ready_sandbox()],
        };
        let actions = compute_pod_actions(&pod, &observed);
        assert!(!actions.kill_pod);
        assert!(!actions.create_sandbox);
        assert_eq!(actions.containers_to_start, vec![1]);
        assert!(actions.containers_to_kill.is_empty());
    }

    #[test]
    fn unknown_container_is_killed_before_restart() {
        let pod = pod_with_containers(&["a"]);
        let observed = PodRuntimeStatus {
            uid: "u-1".into(),
            containers: vec![container("a", ContainerState::Unknown)],
            sandboxes: vec![ready_sandbox()],
        };
        let actions = compute_pod_actions(&pod, &observed);
        assert_eq!(actions.containers_to_start, vec![0]);
        assert_eq!(actions.containers_to_kill, vec!["c-a".to_string()]);
    }

    #[test]
    fn unready_sandbox_forces_full_restart() {
        let pod = pod_with_containers(&["a"]);
        let mut sandbox = ready_sandbox();
        sandbox.state = SandboxState::NotReady;
        let observed = PodRuntimeStatus {
            uid: "u-1".into(),
            containers: vec![container("a", ContainerState::Running)],
            sandboxes: vec![sandbox],
        };
        let actions = compute_pod_actions(&pod, &observed);
        assert!(actions.kill_pod);
        assert!(actions.create_sandbox);
        assert_eq!(actions.sandbox_id.as_deref(), Some("sbx-1"));
        assert_eq!(actions.containers_to_kill, vec!["c-a".to_string()]);
    }

    #[test]
    fn ip_less_sandbox_is_replaced() {
        let pod = pod_with_containers(&["a"]);
        let mut sandbox = ready_sandbox();
        sandbox.ip = None;
        let observed = PodRuntimeStatus {
            uid: "u-1".into(),
            containers: vec![],
            sandboxes: vec![sandbox],
        };
        assert!(compute_pod_actions(&pod, &observed).kill_pod);
    }

    #[test]
    fn converged_pod_is_a_noop() {
        let pod = pod_with_containers(&["a", "b"]);
        let observed = PodRuntimeStatus {
            uid: "u-1".into(),
            containers: vec![
                container("a", ContainerState::Running),
                container("b", ContainerState::Running),
            ],
            sandboxes: vec![ready_sandbox()],
        };
        assert!(compute_pod_actions(&pod, &observed).is_noop());
    }

    #[tokio::test]
    async fn sync_from_scratch_then_resync_is_idempotent() {
        let runtime = FakeRuntime::new();
        let mediator = RuntimeMediator::new(runtime.engine(), runtime.network());
        let pod = pod_with_containers(&["a", "b"]);

        mediator
            .sync_pod(&pod, &PodRuntimeStatus::empty("u-1"))
            .await
            .unwrap();

        let observed = mediator.observed("u-1").await.unwrap();
        assert!(observed.sandbox_ip().is_some());
        assert_eq!(observed.containers.len(), 2);
        assert_eq!(runtime.pulled_images(), vec!["img/a:1", "img/b:1"]);
        assert!(
            observed
                .containers
                .iter()
                .all(|c| c.state == ContainerState::Running)
        );

        // Identical desired + observed: nothing further to do.
        assert!(compute_pod_actions(&pod, &observed).is_noop());
        let before = runtime.container_ids("u-1");
        mediator.sync_pod(&pod, &observed).await.unwrap();
        assert_eq!(runtime.container_ids("u-1"), before);
    }

    #[tokio::test]
    async fn crashed_container_is_restarted_in_place() {
        let runtime = FakeRuntime::new();
        let mediator = RuntimeMediator::new(runtime.engine(), runtime.network());
        let pod = pod_with_containers(&["a", "b"]);
        mediator
            .sync_pod(&pod, &PodRuntimeStatus::empty("u-1"))
            .await
            .unwrap();

        runtime.exit_container("u-1", "b", 1);
        let observed = mediator.observed("u-1").await.unwrap();
        mediator.sync_pod(&pod, &observed).await.unwrap();

        let observed = mediator.observed("u-1").await.unwrap();
        let running: Vec<_> = observed
            .containers
            .iter()
            .filter(|c| c.state == ContainerState::Running && c.name == "b")
            .collect();
        assert_eq!(running.len(), 1, "replacement for b is running");
        // The sandbox survived the restart.
        assert_eq!(observed.sandboxes.len(), 1);
    }

    #[tokio::test]
    async fn dead_sandbox_is_rebuilt_with_a_fresh_ip() {
        let runtime = FakeRuntime::new();
        let mediator = RuntimeMediator::new(runtime.engine(), runtime.network());
        let pod = pod_with_containers(&["a"]);
        mediator
            .sync_pod(&pod, &PodRuntimeStatus::empty("u-1"))
            .await
            .unwrap();
        let first_ip = mediator.observed("u-1").await.unwrap().sandbox_ip().unwrap();

        runtime.break_sandbox("u-1");
        let observed = mediator.observed("u-1").await.unwrap();
        mediator.sync_pod(&pod, &observed).await.unwrap();

        let observed = mediator.observed("u-1").await.unwrap();
        assert_eq!(observed.sandboxes.len(), 1);
        let ip = observed.sandbox_ip().unwrap();
        assert_ne!(ip, first_ip);
        assert!(
            observed
                .containers
                .iter()
                .any(|c| c.state == ContainerState::Running)
        );
    }

    #[tokio::test]
    async fn kill_pod_removes_everything_and_is_idempotent() {
        let runtime = FakeRuntime::new();
        let mediator = RuntimeMediator::new(runtime.engine(), runtime.network());
        let pod = pod_with_containers(&["a"]);
        mediator
            .sync_pod(&pod, &PodRuntimeStatus::empty("u-1"))
            .await
            .unwrap();

        mediator.kill_pod("u-1").await;
        let observed = mediator.observed("u-1").await.unwrap();
        assert!(observed.containers.is_empty());
        assert!(observed.sandboxes.is_empty());

        // Killing an already-clean pod is harmless.
        mediator.kill_pod("u-1").await;
    }
}
