//! In-process key-value backend.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KeyTtl, KvBackend, KvError, glob_match};
use crate::infra::lock::mutex_lock;

const SOURCE: &str = "infra::kv::memory";
/// Writes prune expired entries once the map holds at least this many keys.
const PRUNE_FLOOR: usize = 1024;

enum Stored {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KvBackend`] with Redis-like semantics.
///
/// Every operation runs under one mutex, which makes counters and set
/// updates atomic. Expired entries are dropped when touched, and writes
/// sweep the whole map whenever it has doubled since the last sweep.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    prune_at: AtomicUsize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including ones that expired but were not yet pruned.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "purge_expired");
        let removed = prune(&mut entries, Instant::now());
        self.rearm(entries.len());
        removed
    }

    fn maybe_prune(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        if entries.len() < self.prune_at.load(Ordering::Relaxed) {
            return;
        }
        let removed = prune(entries, now);
        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "pruned expired keys");
        }
        self.rearm(entries.len());
    }

    fn rearm(&self, len: usize) {
        self.prune_at
            .store(len.saturating_mul(2).max(PRUNE_FLOOR), Ordering::Relaxed);
    }
}

fn prune(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

/// `now + ttl`, or no expiry when the deadline is beyond what `Instant` holds.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        match live(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Stored::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(KvError::WrongType {
                key: key.to_string(),
                op: "get",
            }),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let now = Instant::now();
        let expires_at = ttl.and_then(|ttl| deadline(now, ttl));
        let mut entries = mutex_lock(&self.entries, SOURCE, "set");
        self.maybe_prune(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Bytes(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, KvError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "delete");
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key)
                && !entry.is_expired(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "exists");
        Ok(live(&mut entries, key, Instant::now()).is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "incr_by");
        let now = Instant::now();
        self.maybe_prune(&mut entries, now);

        let (current, expires_at) = match live(&mut entries, key, now) {
            None => (0, None),
            Some(Entry {
                value: Stored::Bytes(bytes),
                expires_at,
            }) => {
                let parsed = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|text| text.parse::<i64>().ok())
                    .ok_or_else(|| KvError::NotAnInteger {
                        key: key.to_string(),
                    })?;
                (parsed, *expires_at)
            }
            Some(_) => {
                return Err(KvError::WrongType {
                    key: key.to_string(),
                    op: "incr_by",
                });
            }
        };

        let next = current
            .checked_add(delta)
            .ok_or_else(|| KvError::NotAnInteger {
                key: key.to_string(),
            })?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Bytes(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "expire");
        let now = Instant::now();
        match live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = deadline(now, ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "ttl");
        let now = Instant::now();
        Ok(match live(&mut entries, key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "set_add");
        let now = Instant::now();
        self.maybe_prune(&mut entries, now);
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Stored::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
                Ok(())
            }
            Some(_) => Err(KvError::WrongType {
                key: key.to_string(),
                op: "set_add",
            }),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Stored::Set(HashSet::from([member.to_string()])),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "set_members");
        match live(&mut entries, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Stored::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(KvError::WrongType {
                key: key.to_string(),
                op: "set_members",
            }),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "scan");
        prune(&mut entries, now);
        Ok(entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }
}
