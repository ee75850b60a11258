use thiserror::Error;

use crate::infra::kv::KvError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache ttl must be greater than zero")]
    InvalidTtl,
    #[error("cache backend failure: {0}")]
    Backend(#[from] KvError),
    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of [`crate::cache::Cache::remember`].
#[derive(Debug, Error)]
pub enum RememberError<E> {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("remember computation failed: {0}")]
    Compute(#[source] E),
}

impl<E> RememberError<E> {
    pub fn into_compute(self) -> Option<E> {
        match self {
            RememberError::Compute(err) => Some(err),
            RememberError::Cache(_) => None,
        }
    }
}
