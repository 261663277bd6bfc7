use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Shared book of live watch cancel handles. The heartbeat client fires
/// `cancel_all` when the liveness channel dies; informers re-register as
/// they restart their streams.
#[derive(Clone, Default)]
pub struct WatchRegistry {
    tokens: Arc<Mutex<Vec<CancellationToken>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().expect("registry lock poisoned");
        tokens.retain(|t| !t.is_cancelled());
        tokens.push(token.clone());
        token
    }

    pub fn cancel_all(&self) {
        let mut tokens = self.tokens.lock().expect("registry lock poisoned");
        for token in tokens.drain(..) {
            token.cancel();
        }
    }

    pub fn live_count(&self) -> usize {
        self.tokens
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .filter(|t| !t.is_cancelled())
            .count()
    }
}
