//! In-process `Kv` backend. Backs the test suites and the single-process
//! dev daemon; a deployment against a real replicated store only has to
//! supply another `Kv` implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Kv, KvEvent, KvWatch};

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<KvEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Bytes>,
    watchers: Vec<Watcher>,
}

impl Inner {
    /// Publish while holding the map lock, which is what gives watchers
    /// commit-order delivery.
    fn publish(&mut self, event: KvEvent) {
        self.watchers.retain(|w| {
            if w.cancel.is_cancelled() {
                return false;
            }
            if !event.key().starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("kv lock poisoned")
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        Ok(self.lock().data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.data.insert(key.to_string(), value.clone());
        inner.publish(KvEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        if let Some(prior) = inner.data.remove(key) {
            inner.publish(KvEvent::Delete {
                key: key.to_string(),
                value: prior,
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, Error> {
        let inner = self.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> Result<KvWatch, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
            cancel: cancel.clone(),
        });
        Ok(KvWatch { events: rx, cancel })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let kv = MemoryKv::new();
        kv.put("/apis/pod/a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(
            kv.get("/apis/pod/a").await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
        kv.delete("/apis/pod/a").await.unwrap();
        assert_eq!(kv.get("/apis/pod/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let kv = MemoryKv::new();
        kv.put("/apis/pod/a", Bytes::from_static(b"1")).await.unwrap();
        kv.put("/apis/pod/b", Bytes::from_static(b"2")).await.unwrap();
        kv.put("/apis/node/c", Bytes::from_static(b"3")).await.unwrap();

        let pods = kv.list("/apis/pod/").await.unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods.iter().all(|(k, _)| k.starts_with("/apis/pod/")));
    }

    #[tokio::test]
    async fn watch_delivers_in_commit_order() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch("/apis/pod/").unwrap();

        kv.put("/apis/pod/a", Bytes::from_static(b"1")).await.unwrap();
        kv.put("/apis/pod/a", Bytes::from_static(b"2")).await.unwrap();
        kv.delete("/apis/pod/a").await.unwrap();
        kv.put("/apis/node/x", Bytes::from_static(b"n")).await.unwrap();

        match watch.events.recv().await.unwrap() {
            KvEvent::Put { value, .. } => assert_eq!(value, Bytes::from_static(b"1")),
            other => panic!("unexpected event: {other:?}"),
        }
        match watch.events.recv().await.unwrap() {
            KvEvent::Put { value, .. } => assert_eq!(value, Bytes::from_static(b"2")),
            other => panic!("unexpected event: {other:?}"),
        }
        match watch.events.recv().await.unwrap() {
            KvEvent::Delete { value, .. } => assert_eq!(value, Bytes::from_static(b"2")),
            other => panic!("unexpected event: {other:?}"),
        }
        // The node write must not leak into the pod watch.
        assert!(watch.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_watcher_is_pruned() {
        let kv = MemoryKv::new();
        let watch = kv.watch("/apis/pod/").unwrap();
        watch.cancel.cancel();

        kv.put("/apis/pod/a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(kv.lock().watchers.len(), 0);
    }
}
