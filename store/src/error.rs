#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Normal for stale caches; consumed silently by re-sync.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Retry on the next level-triggered pass.
    #[error("store temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("decode failed: {source}")]
    Decode {
        #[from]
        source: serde_json::Error,
    },

    /// Unrecoverable configuration error; the process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientUnavailable(_))
    }
}
