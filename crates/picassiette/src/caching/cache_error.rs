use std::io;

use thiserror::Error;

/// An error that happens while reading from or writing to one of the cache tiers.
///
/// None of these errors are surfaced to callers of the fetch API. A failed read is treated as a
/// cache miss, and a failed write is dropped after being logged.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The persistent store is not initialized yet, or is being reset.
    #[error("store unavailable")]
    StoreUnavailable,
    /// Reading or writing a cache file failed.
    #[error("cache io failure")]
    Io(#[from] io::Error),
    /// A payload could not be encoded for the persistent store.
    #[error("failed to encode cache entry: {0}")]
    Encode(String),
    /// A cache file could not be decoded into a payload.
    #[error("failed to decode cache entry: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Io(err.into())
        } else {
            Self::Decode(err.to_string())
        }
    }
}

impl CacheError {
    /// Whether this error only signals that the persistent store is not usable right now.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable)
    }

    /// Logs this error, unless it is an expected [`StoreUnavailable`](Self::StoreUnavailable).
    pub(crate) fn log(&self, key: &str, action: &'static str) {
        if self.is_unavailable() {
            tracing::debug!(key, action, "store unavailable");
        } else {
            tracing::error!(error = self as &dyn std::error::Error, key, action, "cache io failure");
        }
    }
}
