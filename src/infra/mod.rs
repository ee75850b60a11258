//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod kv;
pub(crate) mod lock;
pub mod telemetry;
