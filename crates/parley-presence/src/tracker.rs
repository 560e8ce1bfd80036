use crate::kv::PresenceKv;
use crate::watchdog::OfflineTransition;
use crate::{conn_set_key, heartbeat_key, last_seen_key, now_ms, PresenceError, CONN_SET_PREFIX};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-connection presence over the shared KV. A user is online while
/// at least one of their connections holds a live heartbeat key.
#[derive(Clone)]
pub struct PresenceTracker {
    kv: Arc<dyn PresenceKv>,
    heartbeat_ttl: Duration,
    offline_tx: Option<mpsc::Sender<OfflineTransition>>,
}

impl PresenceTracker {
    pub fn new(kv: Arc<dyn PresenceKv>, heartbeat_ttl: Duration) -> Self {
        Self {
            kv,
            heartbeat_ttl,
            offline_tx: None,
        }
    }

    /// Attach the listener that consumes offline transitions produced
    /// by ghost pruning. Share the sender with the watchdog so both
    /// reap paths feed the same consumer.
    pub fn with_offline_notifications(mut self, tx: mpsc::Sender<OfflineTransition>) -> Self {
        self.offline_tx = Some(tx);
        self
    }

    pub fn kv(&self) -> Arc<dyn PresenceKv> {
        self.kv.clone()
    }

    /// Register a live connection: heartbeat key plus reverse-set entry.
    /// The stale last-seen value is cleared since the user is online now.
    pub async fn mark_online(&self, user_id: &str, conn_id: &str) -> Result<(), PresenceError> {
        self.kv
            .set_with_ttl(&heartbeat_key(user_id, conn_id), "1", self.heartbeat_ttl)
            .await?;
        self.kv.sadd(&conn_set_key(user_id), conn_id).await?;
        self.kv.del(&last_seen_key(user_id)).await?;
        debug!(user = user_id, conn = conn_id, "connection online");
        Ok(())
    }

    /// Drop one connection. When it was the user's last, the user has
    /// transitioned offline: last-seen is recorded exactly once and its
    /// value returned.
    pub async fn mark_offline(
        &self,
        user_id: &str,
        conn_id: &str,
    ) -> Result<Option<u64>, PresenceError> {
        self.kv.del(&heartbeat_key(user_id, conn_id)).await?;
        let removed = self.kv.srem(&conn_set_key(user_id), conn_id).await?;
        if !removed {
            // Already reaped (by the watchdog or a duplicate teardown);
            // the transition was recorded by whoever removed it.
            return Ok(None);
        }
        if self.kv.scard(&conn_set_key(user_id)).await? > 0 {
            return Ok(None);
        }
        let ts = now_ms();
        self.kv.set(&last_seen_key(user_id), &ts.to_string()).await?;
        debug!(user = user_id, last_seen_ms = ts, "user offline");
        Ok(Some(ts))
    }

    /// Extend a connection's heartbeat. Returns false when the heartbeat
    /// already expired; the caller must treat the session as dead rather
    /// than silently resurrecting it.
    pub async fn refresh(&self, user_id: &str, conn_id: &str) -> Result<bool, PresenceError> {
        self.kv
            .expire_if_exists(&heartbeat_key(user_id, conn_id), self.heartbeat_ttl)
            .await
    }

    /// Whether the user has at least one live connection. Ghost entries
    /// (set members whose heartbeat lapsed) are pruned as a side effect.
    pub async fn is_user_online(&self, user_id: &str) -> Result<bool, PresenceError> {
        let mut online = false;
        let mut pruned = 0usize;
        for conn_id in self.kv.smembers(&conn_set_key(user_id)).await? {
            if self.kv.exists(&heartbeat_key(user_id, conn_id.as_str())).await? {
                online = true;
            } else {
                self.kv.srem(&conn_set_key(user_id), &conn_id).await?;
                pruned += 1;
            }
        }
        // Pruning the last lapsed connection IS the offline transition;
        // it must not wait for the next watchdog tick, which would find
        // an already-empty set and skip the user.
        if !online && pruned > 0 && self.kv.scard(&conn_set_key(user_id)).await? == 0 {
            self.record_offline(user_id).await?;
        }
        Ok(online)
    }

    /// Record last-seen for a connection set that just emptied and
    /// notify the offline listener. A racing clean disconnect or
    /// watchdog sweep keeps its earlier record; only the first writer
    /// emits the transition.
    async fn record_offline(&self, user_id: &str) -> Result<(), PresenceError> {
        if self.kv.get(&last_seen_key(user_id)).await?.is_some() {
            return Ok(());
        }
        let ts = now_ms();
        self.kv.set(&last_seen_key(user_id), &ts.to_string()).await?;
        debug!(user = user_id, last_seen_ms = ts, "pruned last lapsed connection, user offline");
        if let Some(tx) = &self.offline_tx {
            let transition = OfflineTransition {
                user_id: user_id.to_string(),
                last_seen_ms: ts,
            };
            if tx.send(transition).await.is_err() {
                debug!("offline transition listener dropped");
            }
        }
        Ok(())
    }

    /// Online flags for a batch of users, keyed by user id.
    pub async fn is_online_many(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, bool>, PresenceError> {
        let mut out = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            out.insert(user_id.clone(), self.is_user_online(user_id).await?);
        }
        Ok(out)
    }

    /// Last-seen millis, recorded when the user's final connection
    /// dropped. None while online or never seen.
    pub async fn last_seen(&self, user_id: &str) -> Result<Option<u64>, PresenceError> {
        Ok(self
            .kv
            .get(&last_seen_key(user_id))
            .await?
            .and_then(|v| v.parse().ok()))
    }

    /// Every user with at least one live connection.
    pub async fn list_online_users(&self) -> Result<Vec<String>, PresenceError> {
        let mut users = Vec::new();
        for key in self.kv.scan_prefix(CONN_SET_PREFIX).await? {
            let user_id = &key[CONN_SET_PREFIX.len()..];
            if self.is_user_online(user_id).await? {
                users.push(user_id.to_string());
            }
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::watchdog::{Watchdog, WatchdogConfig};

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Arc::new(MemoryKv::new()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn online_until_last_connection_drops() {
        let t = tracker();
        t.mark_online("u", "c1").await.unwrap();
        t.mark_online("u", "c2").await.unwrap();
        assert!(t.is_user_online("u").await.unwrap());

        assert_eq!(t.mark_offline("u", "c1").await.unwrap(), None);
        assert!(t.is_user_online("u").await.unwrap());

        let last_seen = t.mark_offline("u", "c2").await.unwrap();
        assert!(last_seen.is_some());
        assert!(!t.is_user_online("u").await.unwrap());
        assert_eq!(t.last_seen("u").await.unwrap(), last_seen);
    }

    #[tokio::test]
    async fn duplicate_teardown_records_last_seen_once() {
        let t = tracker();
        t.mark_online("u", "c1").await.unwrap();
        assert!(t.mark_offline("u", "c1").await.unwrap().is_some());
        // Second teardown of the same connection is a no-op.
        assert_eq!(t.mark_offline("u", "c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reconnect_clears_last_seen() {
        let t = tracker();
        t.mark_online("u", "c1").await.unwrap();
        t.mark_offline("u", "c1").await.unwrap();
        assert!(t.last_seen("u").await.unwrap().is_some());

        t.mark_online("u", "c2").await.unwrap();
        assert_eq!(t.last_seen("u").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cannot_resurrect_expired_heartbeat() {
        let t = tracker();
        t.mark_online("u", "c1").await.unwrap();
        assert!(t.refresh("u", "c1").await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!t.refresh("u", "c1").await.unwrap());
        assert!(!t.is_user_online("u").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ghost_set_entries_are_pruned_on_read() {
        let t = tracker();
        t.mark_online("u", "c1").await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        // Heartbeat lapsed without a clean disconnect.
        assert!(!t.is_user_online("u").await.unwrap());
        assert_eq!(t.kv().scard(&conn_set_key("u")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_online_users_filters_offline() {
        let t = tracker();
        t.mark_online("a", "c1").await.unwrap();
        t.mark_online("b", "c2").await.unwrap();
        t.mark_offline("b", "c2").await.unwrap();

        assert_eq!(t.list_online_users().await.unwrap(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_the_last_lapsed_connection_records_the_transition() {
        let kv = Arc::new(MemoryKv::new());
        let (tx, mut rx) = mpsc::channel(4);
        let t = PresenceTracker::new(kv.clone(), Duration::from_secs(30))
            .with_offline_notifications(tx);
        t.mark_online("u", "c1").await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        // The online check prunes the set to empty before any watchdog
        // tick gets to see the lapsed connection.
        assert!(!t.is_user_online("u").await.unwrap());
        let transition = rx.try_recv().unwrap();
        assert_eq!(transition.user_id, "u");
        assert_eq!(t.last_seen("u").await.unwrap(), Some(transition.last_seen_ms));

        // The next sweep finds last-seen in place: no duplicate.
        let (wtx, mut wrx) = mpsc::channel(4);
        let watchdog = Watchdog::new(kv, WatchdogConfig::default(), wtx);
        watchdog.reconcile().await.unwrap();
        assert!(wrx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_a_ghost_beside_a_live_connection_stays_online() {
        let (tx, mut rx) = mpsc::channel(4);
        let t = PresenceTracker::new(Arc::new(MemoryKv::new()), Duration::from_secs(30))
            .with_offline_notifications(tx);
        t.mark_online("u", "c1").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        t.mark_online("u", "c2").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        // c1 lapsed, c2 still live: prune without a transition.
        assert!(t.is_user_online("u").await.unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(t.last_seen("u").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batch_online_lookup() {
        let t = tracker();
        t.mark_online("a", "c1").await.unwrap();
        let flags = t
            .is_online_many(&["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(flags.get("a"), Some(&true));
        assert_eq!(flags.get("b"), Some(&false));
    }
}
