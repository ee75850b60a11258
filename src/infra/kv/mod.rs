//! Networked key-value service abstraction.
//!
//! Both the Redis-backed session store and the cache store speak to the backend
//! through [`KvBackend`]. Two implementations ship:
//!
//! - [`RedisKv`]: a Redis server reached through a multiplexed connection manager.
//! - [`MemoryKv`]: an in-process table with the same TTL, counter and set
//!   semantics, for single-node deployments and tests.
//!
//! Keys passed to the backend are already fully prefixed by the caller.

mod memory;
mod redis_kv;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("value at `{key}` holds the wrong kind of value for `{op}`")]
    WrongType { key: String, op: &'static str },
    #[error("value at `{key}` is not an integer")]
    NotAnInteger { key: String },
}

/// Remaining lifetime of a key as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the contained duration.
    Expires(Duration),
}

impl KeyTtl {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(remaining) => Some(*remaining),
            KeyTtl::Missing | KeyTtl::Persistent => None,
        }
    }
}

/// Primitive operations of a key-value service with native per-key expiry.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Fetch a string value. Missing and expired keys yield `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store a string value, replacing any previous value and expiry.
    ///
    /// `None` stores the value without expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Remove keys, returning how many existed. Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<u64, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Atomically add `delta` to an integer value, creating it at 0 first.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// Arm an expiry on an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError>;

    /// Add a member to the set stored at `key`, creating the set if needed.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// List keys matching a glob pattern (`*` and `?` wildcards).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}

/// Match `candidate` against a glob with `*` (any run) and `?` (any single char).
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}
