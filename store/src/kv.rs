use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// A single change from the KV commit log. `Delete` carries the last
/// committed value so typed consumers can identify the removed object.
#[derive(Clone, Debug)]
pub enum KvEvent {
    Put { key: String, value: Bytes },
    Delete { key: String, value: Bytes },
}

impl KvEvent {
    pub fn key(&self) -> &str {
        match self {
            KvEvent::Put { key, .. } | KvEvent::Delete { key, .. } => key,
        }
    }
}

/// A live change stream plus its cancel handle. Events arrive in commit
/// order; the stream may coalesce or drop intermediate values around
/// reconnects, so consumers must stay level-triggered.
pub struct KvWatch {
    pub events: mpsc::UnboundedReceiver<KvEvent>,
    pub cancel: CancellationToken,
}

/// Contract required of the replicated KV store backing the authority.
/// Failures surface as `TransientUnavailable` (retryable) or `Fatal`.
#[async_trait]
pub trait Kv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error>;

    async fn put(&self, key: &str, value: Bytes) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, Error>;

    fn watch(&self, prefix: &str) -> Result<KvWatch, Error>;
}
