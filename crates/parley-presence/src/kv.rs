use crate::PresenceError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// The shared store the presence layer runs on: string values with
/// per-key expiration, plus atomic set membership. Matches the Redis
/// command subset the production backend uses.
#[async_trait]
pub trait PresenceKv: Send + Sync {
    /// Plain SET, no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), PresenceError>;
    /// SET with TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), PresenceError>;
    /// SET-if-absent with TTL. Returns true when the key was set.
    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, PresenceError>;
    async fn get(&self, key: &str) -> Result<Option<String>, PresenceError>;
    async fn exists(&self, key: &str) -> Result<bool, PresenceError>;
    async fn del(&self, key: &str) -> Result<(), PresenceError>;
    /// Extend a key's TTL only if it still exists. Never creates the key.
    async fn expire_if_exists(&self, key: &str, ttl: Duration) -> Result<bool, PresenceError>;
    async fn sadd(&self, key: &str, member: &str) -> Result<(), PresenceError>;
    /// Returns true if the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, PresenceError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, PresenceError>;
    async fn scard(&self, key: &str) -> Result<usize, PresenceError>;
    /// All keys starting with `prefix` (SCAN MATCH on Redis).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, PresenceError>;
}

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-memory backend with lazy expiry. Used by tests and single-process
/// deployments without a Redis.
#[derive(Default)]
pub struct MemoryKv {
    values: DashMap<String, ValueEntry>,
    sets: DashMap<String, HashSet<String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        // The shard guard must be released before removing an expired key.
        let expired = match self.values.get(key) {
            Some(entry) if entry.live() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        None
    }
}

#[async_trait]
impl PresenceKv for MemoryKv {
    async fn set(&self, key: &str, value: &str) -> Result<(), PresenceError> {
        self.values.insert(
            key.to_string(),
            ValueEntry { value: value.to_string(), expires_at: None },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.set_with_ttl(key, value, ttl).await?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PresenceError> {
        Ok(self.live_value(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, PresenceError> {
        Ok(self.live_value(key).is_some())
    }

    async fn del(&self, key: &str) -> Result<(), PresenceError> {
        self.values.remove(key);
        Ok(())
    }

    async fn expire_if_exists(&self, key: &str, ttl: Duration) -> Result<bool, PresenceError> {
        if self.live_value(key).is_none() {
            return Ok(false);
        }
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), PresenceError> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, PresenceError> {
        let removed = self
            .sets
            .get_mut(key)
            .map(|mut set| set.remove(member))
            .unwrap_or(false);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, PresenceError> {
        let mut members: Vec<String> = self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<usize, PresenceError> {
        Ok(self.sets.get(key).map(|set| set.len()).unwrap_or(0))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, PresenceError> {
        let mut keys: Vec<String> = self
            .sets
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        keys.extend(
            self.values
                .iter()
                .filter(|entry| entry.key().starts_with(prefix) && entry.value().live())
                .map(|entry| entry.key().clone()),
        );
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_is_lazy_but_observed() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("k", "v", Duration::from_secs(5)).await.unwrap();
        assert!(kv.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!kv.exists("k").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_if_exists_never_resurrects() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("k", "v", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        // Expired: the extend must report failure, not recreate the key.
        assert!(!kv.expire_if_exists("k", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_live_keys_only() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_with_ttl("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_nx_with_ttl("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(kv.set_nx_with_ttl("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn set_membership() {
        let kv = MemoryKv::new();
        kv.sadd("s", "a").await.unwrap();
        kv.sadd("s", "b").await.unwrap();
        kv.sadd("s", "a").await.unwrap();
        assert_eq!(kv.scard("s").await.unwrap(), 2);
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["a", "b"]);

        assert!(kv.srem("s", "a").await.unwrap());
        assert!(!kv.srem("s", "a").await.unwrap());
        assert_eq!(kv.scard("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_prefix_skips_empty_sets() {
        let kv = MemoryKv::new();
        kv.sadd("online_users:a", "c1").await.unwrap();
        kv.sadd("online_users:b", "c2").await.unwrap();
        kv.srem("online_users:b", "c2").await.unwrap();
        assert_eq!(
            kv.scan_prefix("online_users:").await.unwrap(),
            vec!["online_users:a"]
        );
    }
}
