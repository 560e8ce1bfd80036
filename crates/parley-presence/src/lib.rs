//! Presence: live-connection tracking and reconciliation.
//!
//! Presence has no durable identity. It is reconstructed entirely from
//! TTL'd heartbeat keys and per-user connection-id sets in a shared
//! low-latency store (Redis in production, an in-memory backend in
//! tests). Absence of a heartbeat IS the offline signal; nothing here
//! cancels anything.

mod kv;
mod redis_kv;
mod tracker;
mod watchdog;

pub use kv::{MemoryKv, PresenceKv};
pub use redis_kv::RedisKv;
pub use tracker::PresenceTracker;
pub use watchdog::{OfflineTransition, Watchdog, WatchdogConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for PresenceError {
    fn from(e: redis::RedisError) -> Self {
        PresenceError::Unavailable(e.to_string())
    }
}

/// Key of a single connection's TTL heartbeat.
pub fn heartbeat_key(user_id: &str, conn_id: &str) -> String {
    format!("online:{user_id}:{conn_id}")
}

/// Key of the reverse set of connection ids per user.
pub fn conn_set_key(user_id: &str) -> String {
    format!("online_users:{user_id}")
}

/// Key of the per-user last-seen scalar (millis).
pub fn last_seen_key(user_id: &str) -> String {
    format!("last_seen:{user_id}")
}

pub const CONN_SET_PREFIX: &str = "online_users:";
pub const WATCHDOG_LOCK_KEY: &str = "presence_watchdog_lock";

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
