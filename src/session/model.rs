//! Session entity and the typed values it carries.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::config::MAX_SESSION_AGE;

/// A value stored in a session.
///
/// Every variant is serializable, so each backend can persist any session it
/// is handed without a fallible type inspection step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "crate::util::base64_bytes")] Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One client's server-tracked state.
///
/// Timestamps are UTC. `expires_at` never precedes `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    data: HashMap<String, Value>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

impl Session {
    /// Create an empty session with a fresh identifier that lives for `max_age`.
    pub fn new(max_age: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: generate_session_id(),
            data: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: expiry_after(now, max_age),
        }
    }

    /// Create a session with a fresh identifier carrying `data`.
    pub fn with_data(data: HashMap<String, Value>, max_age: Duration) -> Self {
        let mut session = Self::new(max_age);
        session.data = data;
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// A session expires once `now` is strictly past `expires_at`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Time left before expiry, or `None` when already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.expires_at - OffsetDateTime::now_utc();
        if left.is_positive() {
            Duration::try_from(left).ok()
        } else {
            None
        }
    }

    /// Move the expiry to `now + max_age`, with `max_age` capped at
    /// [`MAX_SESSION_AGE`].
    pub fn refresh_expiry(&mut self, max_age: Duration) {
        self.set_expires_at(expiry_after(OffsetDateTime::now_utc(), max_age));
    }

    /// Set an absolute expiry, clamped so it never precedes creation.
    pub fn set_expires_at(&mut self, at: OffsetDateTime) {
        self.expires_at = at.max(self.created_at);
    }

    /// Record an access without changing the payload.
    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.touch();
        self.data.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.touch();
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> HashMap<String, Value> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Short identifier prefix safe to put in logs.
    pub(crate) fn log_id(&self) -> &str {
        log_id(&self.id)
    }
}

/// `now + max_age`, saturating instead of overflowing the calendar.
fn expiry_after(now: OffsetDateTime, max_age: Duration) -> OffsetDateTime {
    time::Duration::try_from(max_age.min(MAX_SESSION_AGE))
        .ok()
        .and_then(|age| now.checked_add(age))
        .unwrap_or(now)
}

pub(crate) fn log_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// 32 bytes from the OS random source, base64url without padding.
pub(crate) fn generate_session_id() -> String {
    let mut raw = [0_u8; 32];
    raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(raw)
}
