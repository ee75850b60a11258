use thiserror::Error;

use crate::infra::kv::KvError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session backend failure: {0}")]
    Backend(#[from] KvError),
    #[error("session could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session cookie could not be decoded: {0}")]
    Decode(String),
}

impl SessionError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// True for the outcomes that mean "no usable session" rather than a failure.
    pub fn is_absent(&self) -> bool {
        matches!(self, SessionError::NotFound | SessionError::Expired)
    }
}
