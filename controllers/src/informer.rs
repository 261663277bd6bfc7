//! Informer: consumes a kind's change stream, maintains a UID-keyed cache,
//! and emits semantic `Create`/`Update`/`Remove` events to subscribers after
//! diffing. Survives stream loss by re-listing and reconciling the cache, so
//! subscribers converge even across missed events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use cube_common::wait::backoff_full_jitter;
use cube_store::{Gateway, WatchEventType, WatchRegistry};
use cube_types::{
    ApiObject, Pod, ReplicaSet, Service, object_meta_changed, pod_network_changed,
    pod_spec_changed, replica_set_spec_changed, service_critical_changed,
};

use crate::EventQueue;

#[derive(Clone, Debug)]
pub enum Event<K> {
    Create(K),
    Update(K),
    Remove(K),
}

impl<K> Event<K> {
    pub fn object(&self) -> &K {
        match self {
            Event::Create(obj) | Event::Update(obj) | Event::Remove(obj) => obj,
        }
    }
}

/// Shared read view of an informer's cache.
pub struct Store<K> {
    inner: Arc<RwLock<HashMap<String, K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: Clone> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> Option<K> {
        self.inner.read().get(uid).cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.inner.read().values().cloned().collect()
    }

    pub fn insert(&self, uid: impl Into<String>, obj: K) {
        self.inner.write().insert(uid.into(), obj);
    }

    pub fn remove(&self, uid: &str) -> Option<K> {
        self.inner.write().remove(uid)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn uids(&self) -> HashSet<String> {
        self.inner.read().keys().cloned().collect()
    }
}

type ObjectFilter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

pub struct Informer<K: ApiObject> {
    gateway: Gateway<K>,
    cache: Store<K>,
    changed: fn(&K, &K) -> bool,
    filter: Option<ObjectFilter<K>>,
    registry: Option<WatchRegistry>,
    subscribers: Vec<EventQueue<Event<K>>>,
}

impl<K: ApiObject> Informer<K> {
    /// `changed` decides whether a `Put` for a cached UID is worth an
    /// `Update` event for this informer's subscribers; the cache itself is
    /// refreshed on every `Put` regardless.
    pub fn new(gateway: Gateway<K>, changed: fn(&K, &K) -> bool) -> Self {
        Self {
            gateway,
            cache: Store::new(),
            changed,
            filter: None,
            registry: None,
            subscribers: Vec::new(),
        }
    }

    /// Ignore objects failing the predicate (e.g. pods bound to some other
    /// node). A cached object that stops matching is removed.
    pub fn with_filter(mut self, filter: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Register every watch stream with `registry` so heartbeat loss can
    /// cancel them; the informer restarts on its own afterwards.
    pub fn with_registry(mut self, registry: WatchRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache(&self) -> Store<K> {
        self.cache.clone()
    }

    pub fn subscribe(&mut self) -> EventQueue<Event<K>> {
        let queue = EventQueue::new();
        self.subscribers.push(queue.clone());
        queue
    }

    pub async fn run(self, cancel: CancellationToken) {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(10);
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.list_and_watch(&cancel).await {
                Ok(()) => attempt = 0,
                Err(err) => {
                    tracing::warn!(kind = %K::KIND, %err, "informer pass failed");
                    attempt += 1;
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            let delay = backoff_full_jitter(base, cap, attempt);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        for queue in &self.subscribers {
            queue.close();
        }
    }

    /// One informer pass: open the stream, reconcile the cache against a
    /// full list, then apply stream events until the stream dies.
    async fn list_and_watch(&self, cancel: &CancellationToken) -> Result<(), cube_store::Error> {
        // Watch before list so nothing committed in between is lost.
        let mut stream = self.gateway.watch()?;
        let stream_cancel = stream.cancel_token();
        let registered = self.registry.as_ref().map(|r| r.register());

        let listed = self.gateway.list().await?;

        let mut seen = HashSet::with_capacity(listed.len());
        for obj in &listed {
            seen.insert(obj.uid().to_string());
        }
        for uid in self.cache.uids() {
            if !seen.contains(&uid) {
                if let Some(gone) = self.cache.remove(&uid) {
                    self.emit(Event::Remove(gone));
                }
            }
        }
        for obj in listed {
            self.apply_put(obj);
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = registered_cancelled(&registered) => {
                    tracing::info!(kind = %K::KIND, "watch cancelled by registry");
                    break;
                }
                event = stream.next() => event,
            };
            match event {
                Some((WatchEventType::Put, obj)) => self.apply_put(obj),
                Some((WatchEventType::Delete, obj)) => self.apply_delete(&obj),
                None => break,
            }
        }
        stream_cancel.cancel();
        if let Some(token) = registered {
            token.cancel();
        }
        Ok(())
    }

    fn apply_put(&self, obj: K) {
        let uid = obj.uid().to_string();
        if let Some(filter) = &self.filter
            && !filter(&obj)
        {
            // Left our purview (e.g. rebound elsewhere): retire it.
            if let Some(gone) = self.cache.remove(&uid) {
                self.emit(Event::Remove(gone));
            }
            return;
        }
        match self.cache.get(&uid) {
            None => {
                self.cache.insert(uid, obj.clone());
                self.emit(Event::Create(obj));
            }
            Some(old) => {
                let changed = (self.changed)(&obj, &old);
                self.cache.insert(uid, obj.clone());
                if changed {
                    self.emit(Event::Update(obj));
                }
            }
        }
    }

    fn apply_delete(&self, obj: &K) {
        if let Some(gone) = self.cache.remove(obj.uid()) {
            self.emit(Event::Remove(gone));
        }
    }

    fn emit(&self, event: Event<K>) {
        let uid = event.object().uid().to_string();
        for queue in &self.subscribers {
            let _ = queue.push(uid.clone(), event.clone());
        }
    }
}

async fn registered_cancelled(token: &Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Spec-watching diff for pods: meta and container/volume spec, never
/// status. Used by the ReplicaSet controller's shared pod informer.
pub fn pod_spec_event_diff(new: &Pod, old: &Pod) -> bool {
    object_meta_changed(&new.meta, &old.meta) || pod_spec_changed(&new.spec, &old.spec)
}

/// The worker agent additionally reacts to status movement on its own pods.
pub fn pod_status_event_diff(new: &Pod, old: &Pod) -> bool {
    pod_spec_event_diff(new, old) || new.status != old.status
}

/// The service programmer cares about labels, the Running boundary, and IPs.
pub fn pod_network_event_diff(new: &Pod, old: &Pod) -> bool {
    pod_network_changed(new, old)
}

pub fn replica_set_event_diff(new: &ReplicaSet, old: &ReplicaSet) -> bool {
    object_meta_changed(&new.meta, &old.meta) || replica_set_spec_changed(&new.spec, &old.spec)
}

pub fn service_event_diff(new: &Service, old: &Service) -> bool {
    service_critical_changed(new, old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_store::{Client, MemoryKv};
    use cube_types::{ObjectMeta, PodSpec, PodStatus};
    use std::time::Duration;

    fn client() -> Client {
        Client::new(Arc::new(MemoryKv::new()), Duration::from_secs(1))
    }

    fn pod(name: &str) -> Pod {
        Pod {
            meta: ObjectMeta {
                name: name.into(),
                ..Default::default()
            },
            spec: PodSpec::default(),
            status: None,
        }
    }

    async fn next_event(queue: &EventQueue<Event<Pod>>) -> Event<Pod> {
        tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .expect("timed out waiting for informer event")
            .expect("queue closed")
    }

    async fn assert_quiet(queue: &EventQueue<Event<Pod>>) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_empty(), "expected no informer event");
    }

    #[tokio::test]
    async fn emits_semantic_events_after_diffing() {
        let client = client();
        let mut informer = Informer::new(client.pods.clone(), pod_spec_event_diff);
        let events = informer.subscribe();
        let cache = informer.cache();
        let cancel = CancellationToken::new();
        tokio::spawn(informer.run(cancel.clone()));

        let mut created = client.pods.create(pod("web-a")).await.unwrap();
        match next_event(&events).await {
            Event::Create(p) => assert_eq!(p.name(), "web-a"),
            other => panic!("expected Create, got {other:?}"),
        }

        // Status-only movement is invisible to a spec-watching informer,
        // but the cache still refreshes.
        created.status = Some(PodStatus::default());
        client.pods.update(created.clone()).await.unwrap();
        assert_quiet(&events).await;
        let mut ok = false;
        for _ in 0..100 {
            if cache.get(created.uid()).is_some_and(|p| p.status.is_some()) {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ok, "cache did not refresh on status-only put");

        created.meta.labels.insert("app".into(), "web".into());
        client.pods.update(created.clone()).await.unwrap();
        match next_event(&events).await {
            Event::Update(p) => assert_eq!(p.meta.labels.len(), 1),
            other => panic!("expected Update, got {other:?}"),
        }

        client.pods.delete(created.uid()).await.unwrap();
        match next_event(&events).await {
            Event::Remove(p) => assert_eq!(p.uid(), created.uid()),
            other => panic!("expected Remove, got {other:?}"),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn relist_converges_after_stream_loss() {
        let client = client();
        let registry = WatchRegistry::new();
        let mut informer =
            Informer::new(client.pods.clone(), pod_spec_event_diff).with_registry(registry.clone());
        let events = informer.subscribe();
        let cache = informer.cache();
        let cancel = CancellationToken::new();
        tokio::spawn(informer.run(cancel.clone()));

        let a = client.pods.create(pod("a")).await.unwrap();
        match next_event(&events).await {
            Event::Create(p) => assert_eq!(p.name(), "a"),
            other => panic!("expected Create, got {other:?}"),
        }

        // Kill the stream, then mutate while the informer is dark.
        registry.cancel_all();
        client.pods.delete(a.uid()).await.unwrap();
        let b = client.pods.create(pod("b")).await.unwrap();

        // The restart pass must reconcile: Remove(a), Create(b).
        let mut saw_remove = false;
        let mut saw_create = false;
        for _ in 0..2 {
            match next_event(&events).await {
                Event::Remove(p) => {
                    assert_eq!(p.uid(), a.uid());
                    saw_remove = true;
                }
                Event::Create(p) => {
                    assert_eq!(p.uid(), b.uid());
                    saw_create = true;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_remove && saw_create);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(b.uid()).is_some());

        cancel.cancel();
    }

    #[tokio::test]
    async fn filter_scopes_the_cache_and_retires_rebound_objects() {
        let client = client();
        let mut informer = Informer::new(client.pods.clone(), pod_status_event_diff)
            .with_filter(|p: &Pod| p.node_uid() == Some("n-1"));
        let events = informer.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(informer.run(cancel.clone()));

        let mut created = client.pods.create(pod("a")).await.unwrap();
        assert_quiet(&events).await;

        created.status = Some(PodStatus {
            node_uid: Some("n-1".into()),
            ..Default::default()
        });
        created = client.pods.update(created).await.unwrap();
        match next_event(&events).await {
            Event::Create(p) => assert_eq!(p.uid(), created.uid()),
            other => panic!("expected Create, got {other:?}"),
        }

        created.status.as_mut().unwrap().node_uid = Some("n-2".into());
        client.pods.update(created.clone()).await.unwrap();
        match next_event(&events).await {
            Event::Remove(p) => assert_eq!(p.uid(), created.uid()),
            other => panic!("expected Remove, got {other:?}"),
        }

        cancel.cancel();
    }
}
