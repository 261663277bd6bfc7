//! Per-node worker agent: drains pod events for the pods bound to this node
//! under the big lock, and pushes observed pod status back to the authority
//! on a timer, but only while the heartbeat channel is up.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cube_controllers::{Event, Harness, Informer, Store, pod_status_event_diff};
use cube_store::{Client, WatchRegistry};
use cube_types::{
    ApiObject, ContainerState, ContainerStateReport, Pod, PodPhase, PodStatus, Uid,
};

use crate::mediator::RuntimeMediator;
use crate::runtime::PodRuntimeStatus;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub status_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(7),
        }
    }
}

pub struct Agent {
    node_uid: Uid,
    client: Client,
    mediator: Arc<RuntimeMediator>,
    pod_cache: Store<Pod>,
    connected: watch::Receiver<bool>,
}

impl Agent {
    pub fn new(
        node_uid: Uid,
        client: Client,
        mediator: Arc<RuntimeMediator>,
        pod_cache: Store<Pod>,
        connected: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_uid,
            client,
            mediator,
            pod_cache,
            connected,
        }
    }

    pub async fn handle_pod_event(&self, event: Event<Pod>) {
        match event {
            Event::Create(pod) => {
                let fresh = PodRuntimeStatus::empty(pod.uid());
                if let Err(err) = self.mediator.sync_pod(&pod, &fresh).await {
                    tracing::warn!(pod = %pod.name(), %err, "initial sync failed");
                }
            }
            Event::Update(pod) => {
                let observed = match self.mediator.observed(pod.uid()).await {
                    Ok(observed) => observed,
                    Err(err) => {
                        tracing::warn!(pod = %pod.name(), %err, "inspect failed, deferring sync");
                        return;
                    }
                };
                if let Err(err) = self.mediator.sync_pod(&pod, &observed).await {
                    tracing::warn!(pod = %pod.name(), %err, "sync failed");
                }
            }
            Event::Remove(pod) => {
                self.mediator.kill_pod(pod.uid()).await;
            }
        }
    }

    /// Snapshot everything the status fan-out needs while the big lock is
    /// held. Returns `None` while the heartbeat is down: a disconnected
    /// worker must not thrash the authority with writes.
    pub fn status_snapshot(&self) -> Option<StatusBatch> {
        if !*self.connected.borrow() {
            tracing::debug!("heartbeat down, skipping status push");
            return None;
        }
        Some(StatusBatch {
            node_uid: self.node_uid.clone(),
            pods: self.pod_cache.list(),
            client: self.client.clone(),
            mediator: self.mediator.clone(),
        })
    }
}

/// One round of status pushes, detached from the agent so the probes and
/// PUTs run outside the big lock.
pub struct StatusBatch {
    node_uid: Uid,
    pods: Vec<Pod>,
    client: Client,
    mediator: Arc<RuntimeMediator>,
}

impl StatusBatch {
    /// Fan the probes out and wait for every write to land before the next
    /// tick can begin.
    pub async fn push(self) {
        let StatusBatch {
            node_uid,
            pods,
            client,
            mediator,
        } = self;
        let tasks: Vec<JoinHandle<()>> = pods
            .into_iter()
            .map(|pod| {
                let node_uid = node_uid.clone();
                let client = client.clone();
                let mediator = mediator.clone();
                tokio::spawn(async move {
                    report_one(node_uid, client, mediator, pod).await;
                })
            })
            .collect();
        futures::future::join_all(tasks).await;
    }
}

async fn report_one(node_uid: Uid, client: Client, mediator: Arc<RuntimeMediator>, mut pod: Pod) {
    let observed = match mediator.observed(pod.uid()).await {
        Ok(observed) => observed,
        Err(err) => {
            tracing::warn!(pod = %pod.name(), %err, "status probe failed");
            return;
        }
    };
    // A pod that has not been given an address yet has nothing to report.
    let Some(ip) = observed.sandbox_ip() else {
        return;
    };
    let phase = compute_phase(&pod, &observed);
    let container_states = pod
        .spec
        .containers
        .iter()
        .map(|spec| {
            let found = observed.find_container(&spec.name);
            ContainerStateReport {
                name: spec.name.clone(),
                state: found.map(|c| c.state).unwrap_or(ContainerState::Unknown),
                exit_code: found.and_then(|c| c.exit_code),
            }
        })
        .collect();
    pod.status = Some(PodStatus {
        phase,
        ip: Some(ip),
        node_uid: Some(node_uid),
        container_states,
    });
    match client.pods.update(pod).await {
        Ok(_) => {
            counter!("agent_status_pushes_total").increment(1);
        }
        Err(err) if err.is_not_found() => {
            // Deleted under us; the Remove event will clean the host up.
        }
        Err(err) => {
            tracing::warn!(%err, "status write failed");
        }
    }
}

/// Observed container states folded into a pod phase.
pub fn compute_phase(desired: &Pod, observed: &PodRuntimeStatus) -> PodPhase {
    if desired.spec.containers.is_empty() {
        return PodPhase::Pending;
    }
    let states: Vec<Option<&crate::runtime::ContainerStatus>> = desired
        .spec
        .containers
        .iter()
        .map(|spec| observed.find_container(&spec.name))
        .collect();

    if states
        .iter()
        .flatten()
        .any(|c| c.state == ContainerState::Exited && c.exit_code.unwrap_or(0) != 0)
    {
        return PodPhase::Failed;
    }
    if states
        .iter()
        .flatten()
        .any(|c| c.state == ContainerState::Unknown)
    {
        return PodPhase::Unknown;
    }
    if states
        .iter()
        .all(|c| c.is_some_and(|c| c.state == ContainerState::Running))
    {
        return PodPhase::Running;
    }
    if states
        .iter()
        .all(|c| c.is_some_and(|c| c.state == ContainerState::Exited))
    {
        return PodPhase::Succeeded;
    }
    PodPhase::Pending
}

/// Wire the agent onto its node-filtered informer and harness.
pub fn spawn(
    node_uid: Uid,
    client: Client,
    mediator: Arc<RuntimeMediator>,
    connected: watch::Receiver<bool>,
    registry: WatchRegistry,
    config: AgentConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let filter_uid = node_uid.clone();
    let mut informer = Informer::new(client.pods.clone(), pod_status_event_diff)
        .with_filter(move |pod: &Pod| pod.node_uid() == Some(filter_uid.as_str()))
        .with_registry(registry);
    let pod_cache = informer.cache();
    let events = informer.subscribe();

    let agent = Agent::new(node_uid, client, mediator, pod_cache, connected);
    let harness = Harness::new("agent", agent);

    vec![
        tokio::spawn(informer.run(cancel.clone())),
        harness.spawn_pump(events, cancel.clone(), |agent, event| async move {
            agent.lock().await.handle_pod_event(event).await;
        }),
        harness.spawn_resync(config.status_interval, cancel, |agent| async move {
            let batch = agent.lock().await.status_snapshot();
            if let Some(batch) = batch {
                batch.push().await;
            }
        }),
    ]
}
