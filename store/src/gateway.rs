use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use cube_types::{ApiObject, Labels, Node, Pod, ReplicaSet, Service, match_label_selector};

use crate::{Error, Kv, KvEvent, KvWatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventType {
    Put,
    Delete,
}

/// Typed change stream for one kind. `next` yields `None` once the stream
/// is cancelled or the backing watch closes; frames that fail to decode are
/// skipped (consumers are level-triggered and re-list on restart).
pub struct WatchStream<K> {
    watch: KvWatch,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ApiObject> WatchStream<K> {
    pub fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.watch.cancel.clone()
    }

    pub async fn next(&mut self) -> Option<(WatchEventType, K)> {
        loop {
            let event = tokio::select! {
                _ = self.watch.cancel.cancelled() => return None,
                event = self.watch.events.recv() => event?,
            };
            let (event_type, bytes) = match event {
                KvEvent::Put { value, .. } => (WatchEventType::Put, value),
                KvEvent::Delete { value, .. } => (WatchEventType::Delete, value),
            };
            match serde_json::from_slice::<K>(&bytes) {
                Ok(obj) => return Some((event_type, obj)),
                Err(err) => {
                    tracing::warn!(kind = %K::KIND, %err, "skipping undecodable watch frame");
                }
            }
        }
    }
}

/// Typed CRUD + watch surface over the KV store for one kind, persisted at
/// `/apis/<kind>/<uid>`. Every operation runs under the configured deadline.
pub struct Gateway<K> {
    kv: Arc<dyn Kv>,
    timeout: Duration,
    _marker: PhantomData<fn() -> K>,
}

impl<K> Clone for Gateway<K> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }
}

impl<K: ApiObject> Gateway<K> {
    pub fn new(kv: Arc<dyn Kv>, timeout: Duration) -> Self {
        Self {
            kv,
            timeout,
            _marker: PhantomData,
        }
    }

    fn prefix() -> String {
        format!("/apis/{}/", K::KIND.path_segment())
    }

    fn key(uid: &str) -> String {
        format!("{}{}", Self::prefix(), uid)
    }

    async fn deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                Error::TransientUnavailable(format!(
                    "{} store operation timed out after {:?}",
                    K::KIND,
                    self.timeout
                ))
            })?
    }

    pub async fn get(&self, uid: &str) -> Result<K, Error> {
        let bytes = self
            .deadline(self.kv.get(&Self::key(uid)))
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {uid}", K::KIND)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn list(&self) -> Result<Vec<K>, Error> {
        let pairs = self.deadline(self.kv.list(&Self::prefix())).await?;
        let mut objects = Vec::with_capacity(pairs.len());
        for (key, bytes) in pairs {
            match serde_json::from_slice::<K>(&bytes) {
                Ok(obj) => objects.push(obj),
                Err(err) => {
                    tracing::warn!(kind = %K::KIND, %key, %err, "skipping undecodable object");
                }
            }
        }
        Ok(objects)
    }

    /// Objects whose labels contain every selector pair.
    pub async fn select(&self, selector: &Labels) -> Result<Vec<K>, Error> {
        let mut objects = self.list().await?;
        objects.retain(|o| match_label_selector(selector, &o.meta().labels));
        Ok(objects)
    }

    /// Persist a new object, assigning its UID. Duplicate names within a
    /// namespace are rejected with `Conflict`.
    pub async fn create(&self, mut obj: K) -> Result<K, Error> {
        if obj.meta().name.is_empty() {
            return Err(Error::BadRequest(format!("{} create without a name", K::KIND)));
        }
        let existing = self.list().await?;
        if existing.iter().any(|o| {
            o.meta().name == obj.meta().name && o.meta().namespace == obj.meta().namespace
        }) {
            return Err(Error::Conflict(format!(
                "{} {}/{} already exists",
                K::KIND,
                obj.meta().namespace,
                obj.meta().name
            )));
        }
        obj.meta_mut().uid = Uuid::new_v4().to_string();
        let bytes = Bytes::from(serde_json::to_vec(&obj)?);
        self.deadline(self.kv.put(&Self::key(obj.uid()), bytes))
            .await?;
        Ok(obj)
    }

    pub async fn update(&self, obj: K) -> Result<K, Error> {
        if obj.uid().is_empty() {
            return Err(Error::BadRequest(format!("{} update without a uid", K::KIND)));
        }
        let key = Self::key(obj.uid());
        if self.deadline(self.kv.get(&key)).await?.is_none() {
            return Err(Error::NotFound(format!("{} {}", K::KIND, obj.uid())));
        }
        let bytes = Bytes::from(serde_json::to_vec(&obj)?);
        self.deadline(self.kv.put(&key, bytes)).await?;
        Ok(obj)
    }

    pub async fn delete(&self, uid: &str) -> Result<(), Error> {
        self.deadline(self.kv.delete(&Self::key(uid))).await
    }

    pub fn watch(&self) -> Result<WatchStream<K>, Error> {
        let watch = self.kv.watch(&Self::prefix())?;
        Ok(WatchStream {
            watch,
            _marker: PhantomData,
        })
    }
}

/// Gateway bundle for every kind the control plane manages, sharing one KV
/// handle. This is the explicit environment value threaded through
/// component constructors; there is no process-wide store client.
#[derive(Clone)]
pub struct Client {
    pub pods: Gateway<Pod>,
    pub replica_sets: Gateway<ReplicaSet>,
    pub services: Gateway<Service>,
    pub nodes: Gateway<Node>,
}

impl Client {
    pub fn new(kv: Arc<dyn Kv>, timeout: Duration) -> Self {
        Self {
            pods: Gateway::new(kv.clone(), timeout),
            replica_sets: Gateway::new(kv.clone(), timeout),
            services: Gateway::new(kv.clone(), timeout),
            nodes: Gateway::new(kv, timeout),
        }
    }
}

/// Look up a node by name, for heartbeat registration.
pub async fn node_by_name(nodes: &Gateway<Node>, name: &str) -> Result<Option<Node>, Error> {
    Ok(nodes.list().await?.into_iter().find(|n| n.name() == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;
    use cube_types::{ObjectMeta, PodSpec};

    fn client() -> Client {
        Client::new(Arc::new(MemoryKv::new()), Duration::from_millis(1500))
    }

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            meta: ObjectMeta {
                name: name.into(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
            spec: PodSpec::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_uid_and_rejects_duplicates() {
        let client = client();
        let created = client.pods.create(pod("web-a", &[])).await.unwrap();
        assert!(!created.uid().is_empty());

        let err = client.pods.create(pod("web-a", &[])).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Same name in another namespace is fine.
        let mut other = pod("web-a", &[]);
        other.meta.namespace = "staging".into();
        client.pods.create(other).await.unwrap();
    }

    #[tokio::test]
    async fn update_requires_existing_uid() {
        let client = client();
        let mut ghost = pod("ghost", &[]);
        ghost.meta.uid = "missing".into();
        let err = client.pods.update(ghost).await.unwrap_err();
        assert!(err.is_not_found());

        let mut created = client.pods.create(pod("web-a", &[])).await.unwrap();
        created.meta.labels.insert("app".into(), "web".into());
        let updated = client.pods.update(created.clone()).await.unwrap();
        assert_eq!(updated, client.pods.get(created.uid()).await.unwrap());
    }

    #[tokio::test]
    async fn select_filters_by_label_subset() {
        let client = client();
        client.pods.create(pod("a", &[("app", "web")])).await.unwrap();
        client.pods.create(pod("b", &[("app", "db")])).await.unwrap();

        let selector = [("app".to_string(), "web".to_string())].into();
        let matched = client.pods.select(&selector).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "a");
    }

    #[tokio::test]
    async fn watch_sees_typed_puts_and_deletes() {
        let client = client();
        let mut stream = client.pods.watch().unwrap();

        let created = client.pods.create(pod("web-a", &[])).await.unwrap();
        client.pods.delete(created.uid()).await.unwrap();

        let (ty, obj) = stream.next().await.unwrap();
        assert_eq!(ty, WatchEventType::Put);
        assert_eq!(obj.name(), "web-a");

        let (ty, obj) = stream.next().await.unwrap();
        assert_eq!(ty, WatchEventType::Delete);
        assert_eq!(obj.uid(), created.uid());
    }

    #[tokio::test]
    async fn cancelled_stream_ends() {
        let client = client();
        let mut stream = client.pods.watch().unwrap();
        stream.cancel_token().cancel();
        assert!(stream.next().await.is_none());
    }
}
