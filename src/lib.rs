//! Session management and response caching for axum services.
//!
//! [`session`] resolves, exposes and persists per-client sessions over a
//! memory, cookie or key-value store. [`cache`] offers a key-value cache with
//! TTLs, counters, tags and single-flight `remember`, plus a middleware that
//! captures and replays whole responses.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod session;
pub mod util;
