//! Population control: keep `spec.replicas` pods matching the selector in
//! `Running`, creating from the template and reaping failures. Both event
//! sources (pod lifecycle, replicaset spec) and the re-sync tick funnel
//! through one `Harness`, so every decision happens under the big lock.

use chrono::{TimeDelta, Utc};
use metrics::counter;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cube_store::Client;
use cube_types::{
    ApiObject, ObjectMeta, Pod, ReplicaSet, ReplicaSetStatus, Uid, match_label_selector,
};

use crate::{Event, EventQueue, Harness, Informer, Store, replica_set_event_diff};

#[derive(Clone, Debug)]
pub struct ReplicaSetConfig {
    /// Minimum age of the last status write before scaling again; gives the
    /// previous round's creations time to reach Running.
    pub quiescence: Duration,
    pub resync: Duration,
}

impl Default for ReplicaSetConfig {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_secs(20),
            resync: Duration::from_secs(10),
        }
    }
}

pub struct ReplicaSetController {
    client: Client,
    rs_cache: Store<ReplicaSet>,
    pod_cache: Store<Pod>,
    config: ReplicaSetConfig,
}

impl ReplicaSetController {
    pub fn new(
        client: Client,
        rs_cache: Store<ReplicaSet>,
        pod_cache: Store<Pod>,
        config: ReplicaSetConfig,
    ) -> Self {
        Self {
            client,
            rs_cache,
            pod_cache,
            config,
        }
    }

    pub async fn handle_rs_event(&self, event: Event<ReplicaSet>) {
        match event {
            Event::Create(rs) | Event::Update(rs) => self.reconcile(&rs).await,
            Event::Remove(rs) => {
                // Matching pods are deliberately left alone; their deletion
                // is observable through the authority, not forced here.
                tracing::info!(replicaset = %rs.name(), "replicaset removed");
            }
        }
    }

    /// A pod event only matters to the replica sets whose selector covers it.
    pub async fn handle_pod_event(&self, event: &Event<Pod>) {
        let pod = event.object();
        for rs in self.rs_cache.list() {
            if match_label_selector(&rs.spec.selector, &pod.meta.labels) {
                self.reconcile(&rs).await;
            }
        }
    }

    pub async fn resync(&self) {
        for rs in self.rs_cache.list() {
            self.reconcile(&rs).await;
        }
    }

    pub async fn reconcile(&self, rs: &ReplicaSet) {
        counter!("replicaset_reconciles_total", "replicaset" => rs.name().to_string())
            .increment(1);

        let Some(status) = rs.status.as_ref() else {
            let mut init = rs.clone();
            init.status = Some(ReplicaSetStatus {
                running_replicas: 0,
                pod_uids_running: Vec::new(),
                pod_uids_to_run: Vec::new(),
                pod_uids_to_kill: Vec::new(),
                last_update_time: Utc::now(),
            });
            if let Err(err) = self.client.replica_sets.update(init).await {
                tracing::warn!(replicaset = %rs.name(), %err, "status init failed");
            }
            return;
        };

        let age = Utc::now().signed_duration_since(status.last_update_time);
        if age < TimeDelta::from_std(self.config.quiescence).unwrap_or_else(|_| TimeDelta::zero())
        {
            return;
        }

        // Cached view only; the authority is never listed on this path. The
        // agents' status pushes keep the cache current.
        let mut running: Vec<Uid> = Vec::new();
        let mut bad: Vec<Uid> = Vec::new();
        for pod in self.pod_cache.list() {
            if !match_label_selector(&rs.spec.selector, &pod.meta.labels) {
                continue;
            }
            let phase = pod.phase();
            if phase == cube_types::PodPhase::Running {
                running.push(pod.meta.uid);
            } else if phase.is_bad() {
                bad.push(pod.meta.uid);
            }
        }

        tracing::info!(
            replicaset = %rs.name(),
            running = running.len(),
            expected = rs.spec.replicas,
            to_run = status.pod_uids_to_run.len(),
            to_kill = status.pod_uids_to_kill.len(),
            bad = bad.len(),
            "population check"
        );

        let to_create = (rs.spec.replicas as i64 - running.len() as i64).max(0) as usize;
        let mut to_run: Vec<Uid> = Vec::with_capacity(to_create);
        for _ in 0..to_create {
            let pod = build_pod_from_template(rs);
            match self.client.pods.create(pod).await {
                Ok(created) => {
                    tracing::info!(
                        replicaset = %rs.name(),
                        pod = %created.name(),
                        uid = %created.meta.uid,
                        "created pod"
                    );
                    to_run.push(created.meta.uid);
                }
                Err(err) => {
                    // Retried on the next tick.
                    tracing::warn!(replicaset = %rs.name(), %err, "pod create failed");
                }
            }
        }

        // Kill: unacknowledged prior kills, prior pending creates that never
        // reached Running, and bad pods. Anything currently Running stays.
        let running_set: HashSet<&str> = running.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut to_kill: Vec<Uid> = Vec::new();
        for uid in status
            .pod_uids_to_kill
            .iter()
            .chain(status.pod_uids_to_run.iter())
            .chain(bad.iter())
        {
            if running_set.contains(uid.as_str()) || !seen.insert(uid.as_str()) {
                continue;
            }
            to_kill.push(uid.clone());
        }
        for uid in &to_kill {
            match self.client.pods.delete(uid).await {
                Ok(()) => tracing::info!(replicaset = %rs.name(), %uid, "deleted pod"),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    tracing::warn!(replicaset = %rs.name(), %uid, %err, "pod delete failed");
                }
            }
        }

        let mut updated = rs.clone();
        updated.status = Some(ReplicaSetStatus {
            running_replicas: running.len() as i32,
            pod_uids_running: running,
            pod_uids_to_run: to_run,
            pod_uids_to_kill: to_kill,
            last_update_time: Utc::now(),
        });
        if let Err(err) = self.client.replica_sets.update(updated).await {
            tracing::warn!(replicaset = %rs.name(), %err, "status write failed");
        }
    }
}

/// Instantiate the template: template labels with the selector labels merged
/// over them, and a random suffix on the name.
fn build_pod_from_template(rs: &ReplicaSet) -> Pod {
    let template = &rs.spec.template;
    let base = if template.meta.name.is_empty() {
        rs.name()
    } else {
        &template.meta.name
    };
    let mut labels = template.meta.labels.clone();
    for (k, v) in &rs.spec.selector {
        labels.insert(k.clone(), v.clone());
    }
    Pod {
        meta: ObjectMeta {
            name: format!("{base}-{}", rand_suffix(5)),
            namespace: rs.meta.namespace.clone(),
            labels,
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

fn rand_suffix(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..len)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect::<String>()
        .to_lowercase()
}

/// Wire the controller onto its informers and harness. The pod informer is
/// shared at the controller-manager level; only its subscription and cache
/// arrive here.
pub fn spawn(
    client: Client,
    pod_cache: Store<Pod>,
    pod_events: EventQueue<Event<Pod>>,
    config: ReplicaSetConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut rs_informer = Informer::new(client.replica_sets.clone(), replica_set_event_diff);
    let rs_cache = rs_informer.cache();
    let rs_events = rs_informer.subscribe();

    let controller = ReplicaSetController::new(client, rs_cache, pod_cache, config.clone());
    let harness = Harness::new("replicaset", controller);

    vec![
        tokio::spawn(rs_informer.run(cancel.clone())),
        harness.spawn_pump(rs_events, cancel.clone(), |c, event| async move {
            c.lock().await.handle_rs_event(event).await;
        }),
        harness.spawn_pump(pod_events, cancel.clone(), |c, event| async move {
            c.lock().await.handle_pod_event(&event).await;
        }),
        harness.spawn_resync(config.resync, cancel, |c| async move {
            c.lock().await.resync().await;
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_store::MemoryKv;
    use cube_types::{ContainerSpec, Labels, PodSpec, PodStatus, PodTemplate, ReplicaSetSpec};
    use std::sync::Arc;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn replica_set(replicas: i32) -> ReplicaSet {
        ReplicaSet {
            meta: ObjectMeta {
                name: "web".into(),
                ..Default::default()
            },
            spec: ReplicaSetSpec {
                replicas,
                selector: labels(&[("app", "x")]),
                template: PodTemplate {
                    meta: ObjectMeta {
                        name: "web".into(),
                        labels: labels(&[("app", "x")]),
                        ..Default::default()
                    },
                    spec: PodSpec {
                        containers: vec![ContainerSpec {
                            name: "web".into(),
                            image: "nginx:1.25".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                },
            },
            status: None,
        }
    }

    struct Fixture {
        client: Client,
        rs_cache: Store<ReplicaSet>,
        pod_cache: Store<Pod>,
        controller: ReplicaSetController,
    }

    fn fixture(quiescence: Duration) -> Fixture {
        let client = Client::new(Arc::new(MemoryKv::new()), Duration::from_secs(1));
        let rs_cache = Store::new();
        let pod_cache = Store::new();
        let controller = ReplicaSetController::new(
            client.clone(),
            rs_cache.clone(),
            pod_cache.clone(),
            ReplicaSetConfig {
                quiescence,
                resync: Duration::from_millis(50),
            },
        );
        Fixture {
            client,
            rs_cache,
            pod_cache,
            controller,
        }
    }

    fn mark_running(pod: &mut Pod, ip: &str) {
        pod.status = Some(PodStatus {
            phase: cube_types::PodPhase::Running,
            ip: Some(ip.parse().unwrap()),
            node_uid: Some("n-1".into()),
            container_states: Vec::new(),
        });
    }

    #[tokio::test]
    async fn scales_up_from_zero_then_settles() {
        let fx = fixture(Duration::ZERO);
        let rs = fx
            .client
            .replica_sets
            .create(replica_set(3))
            .await
            .unwrap();
        fx.rs_cache.insert(rs.meta.uid.clone(), rs.clone());

        // First pass only initializes status.
        fx.controller.reconcile(&rs).await;
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        let status = rs.status.clone().unwrap();
        assert_eq!(status.running_replicas, 0);
        assert!(status.pod_uids_to_run.is_empty());
        assert!(fx.client.pods.list().await.unwrap().is_empty());

        // Second pass creates the population.
        fx.controller.reconcile(&rs).await;
        let pods = fx.client.pods.list().await.unwrap();
        assert_eq!(pods.len(), 3);
        assert!(
            pods.iter()
                .all(|p| p.meta.labels.get("app").map(String::as_str) == Some("x"))
        );
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        let status = rs.status.clone().unwrap();
        assert_eq!(status.running_replicas, 0);
        assert_eq!(status.pod_uids_to_run.len(), 3);
        assert!(status.pod_uids_to_kill.is_empty());

        // The agent brings all three to Running and the cache hears it.
        for mut pod in fx.client.pods.list().await.unwrap() {
            mark_running(&mut pod, "10.44.0.9");
            let pod = fx.client.pods.update(pod).await.unwrap();
            fx.pod_cache.insert(pod.meta.uid.clone(), pod);
        }
        fx.controller.reconcile(&rs).await;
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        let status = rs.status.unwrap();
        assert_eq!(status.running_replicas, 3);
        assert!(status.pod_uids_to_run.is_empty());
        assert!(status.pod_uids_to_kill.is_empty());
        assert_eq!(fx.client.pods.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn replaces_failed_pods() {
        let fx = fixture(Duration::ZERO);
        let rs = fx
            .client
            .replica_sets
            .create(replica_set(2))
            .await
            .unwrap();
        fx.rs_cache.insert(rs.meta.uid.clone(), rs.clone());
        fx.controller.reconcile(&rs).await;
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        fx.controller.reconcile(&rs).await;

        // Both pods reach Running, then one fails.
        let mut pods = fx.client.pods.list().await.unwrap();
        assert_eq!(pods.len(), 2);
        for pod in pods.iter_mut() {
            mark_running(pod, "10.44.0.9");
            let updated = fx.client.pods.update(pod.clone()).await.unwrap();
            fx.pod_cache.insert(updated.meta.uid.clone(), updated);
        }
        let mut failed = pods.remove(0);
        failed.status.as_mut().unwrap().phase = cube_types::PodPhase::Failed;
        let failed = fx.client.pods.update(failed).await.unwrap();
        fx.pod_cache.insert(failed.meta.uid.clone(), failed.clone());

        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        fx.controller.reconcile(&rs).await;

        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        let status = rs.status.unwrap();
        assert_eq!(status.running_replicas, 1);
        assert_eq!(status.pod_uids_to_run.len(), 1, "replacement pod created");
        assert!(status.pod_uids_to_kill.contains(&failed.meta.uid));
        // The failed pod is gone from the authority; the survivor and the
        // replacement remain.
        let remaining = fx.client.pods.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.meta.uid != failed.meta.uid));
    }

    #[tokio::test]
    async fn quiescence_gate_blocks_back_to_back_scaling() {
        let fx = fixture(Duration::from_secs(20));
        let rs = fx
            .client
            .replica_sets
            .create(replica_set(3))
            .await
            .unwrap();
        fx.rs_cache.insert(rs.meta.uid.clone(), rs.clone());

        fx.controller.reconcile(&rs).await;
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        // Status was just initialized: inside the quiescence window nothing
        // may be created.
        fx.controller.reconcile(&rs).await;
        assert!(fx.client.pods.list().await.unwrap().is_empty());

        // Age the status past the window and the scale-up proceeds.
        let mut aged = rs.clone();
        aged.status.as_mut().unwrap().last_update_time =
            Utc::now() - TimeDelta::try_seconds(30).unwrap();
        let aged = fx.client.replica_sets.update(aged).await.unwrap();
        fx.controller.reconcile(&aged).await;
        assert_eq!(fx.client.pods.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unacknowledged_creates_are_reaped_when_not_running() {
        let fx = fixture(Duration::ZERO);
        let rs = fx
            .client
            .replica_sets
            .create(replica_set(1))
            .await
            .unwrap();
        fx.rs_cache.insert(rs.meta.uid.clone(), rs.clone());
        fx.controller.reconcile(&rs).await;
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        fx.controller.reconcile(&rs).await;

        let stuck = &fx.client.pods.list().await.unwrap()[0];
        let stuck_uid = stuck.meta.uid.clone();

        // The pod never reports Running; the next round reaps it and starts
        // a fresh one.
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        fx.controller.reconcile(&rs).await;
        let rs = fx.client.replica_sets.get(rs.uid()).await.unwrap();
        let status = rs.status.unwrap();
        assert!(status.pod_uids_to_kill.contains(&stuck_uid));
        assert_eq!(status.pod_uids_to_run.len(), 1);
        assert_ne!(status.pod_uids_to_run[0], stuck_uid);

        let remaining = fx.client.pods.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].meta.uid, stuck_uid);
    }

    #[test]
    fn template_instantiation_merges_selector_labels() {
        let mut rs = replica_set(1);
        rs.spec.template.meta.labels =
            labels(&[("tier", "front")]);
        let pod = build_pod_from_template(&rs);
        assert!(pod.meta.name.starts_with("web-"));
        assert_eq!(pod.meta.name.len(), "web-".len() + 5);
        assert_eq!(pod.meta.labels.get("app").unwrap(), "x");
        assert_eq!(pod.meta.labels.get("tier").unwrap(), "front");
        assert!(pod.status.is_none());
    }
}
