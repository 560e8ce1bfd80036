use crate::kv::PresenceKv;
use crate::{conn_set_key, heartbeat_key, last_seen_key, now_ms, PresenceError, CONN_SET_PREFIX, WATCHDOG_LOCK_KEY};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A user the watchdog moved offline after its connections all lapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineTransition {
    pub user_id: String,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Reconciliation interval.
    pub tick: Duration,
    /// TTL on the leader lock. Must exceed `tick` so the leader can
    /// renew before losing it.
    pub lock_ttl: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(90),
        }
    }
}

/// Sweeps the connection sets for heartbeats that lapsed without a clean
/// disconnect (process crash, network partition) and records the offline
/// transition those connections never got to. A single instance runs the
/// sweep at a time, elected through a TTL lock in the same store.
pub struct Watchdog {
    kv: Arc<dyn PresenceKv>,
    config: WatchdogConfig,
    holder_id: String,
    offline_tx: mpsc::Sender<OfflineTransition>,
}

impl Watchdog {
    pub fn new(
        kv: Arc<dyn PresenceKv>,
        config: WatchdogConfig,
        offline_tx: mpsc::Sender<OfflineTransition>,
    ) -> Self {
        Self {
            kv,
            config,
            holder_id: Uuid::new_v4().to_string(),
            offline_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(holder = %self.holder_id, tick_ms = self.config.tick.as_millis() as u64, "presence watchdog started");
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.try_acquire().await {
                Ok(true) => {
                    if let Err(e) = self.reconcile().await {
                        warn!(err = %e, "presence reconciliation failed");
                    }
                }
                Ok(false) => debug!("watchdog lock held elsewhere, skipping sweep"),
                Err(e) => warn!(err = %e, "watchdog lock check failed"),
            }
        }
    }

    /// Take or renew the leader lock. Renewal goes through the TTL
    /// extension rather than a fresh SET so an expired lock is never
    /// silently re-held.
    async fn try_acquire(&self) -> Result<bool, PresenceError> {
        if self
            .kv
            .set_nx_with_ttl(WATCHDOG_LOCK_KEY, &self.holder_id, self.config.lock_ttl)
            .await?
        {
            return Ok(true);
        }
        if self.kv.get(WATCHDOG_LOCK_KEY).await?.as_deref() == Some(self.holder_id.as_str()) {
            return self.kv.expire_if_exists(WATCHDOG_LOCK_KEY, self.config.lock_ttl).await;
        }
        Ok(false)
    }

    /// One sweep over every user's connection set: drop members whose
    /// heartbeat lapsed, and when a set empties, record the offline
    /// transition exactly once and notify the listener.
    pub async fn reconcile(&self) -> Result<(), PresenceError> {
        for key in self.kv.scan_prefix(CONN_SET_PREFIX).await? {
            let user_id = key[CONN_SET_PREFIX.len()..].to_string();
            let mut pruned = 0usize;
            for conn_id in self.kv.smembers(&key).await? {
                if !self.kv.exists(&heartbeat_key(&user_id, &conn_id)).await? {
                    self.kv.srem(&key, &conn_id).await?;
                    pruned += 1;
                }
            }
            if pruned == 0 || self.kv.scard(&key).await? > 0 {
                continue;
            }
            // Set just emptied. A racing clean disconnect may have
            // already written last-seen; keep the first record.
            if self.kv.get(&last_seen_key(&user_id)).await?.is_some() {
                continue;
            }
            let ts = now_ms();
            self.kv.set(&last_seen_key(&user_id), &ts.to_string()).await?;
            info!(user = %user_id, pruned, "watchdog moved user offline");
            if self
                .offline_tx
                .send(OfflineTransition { user_id, last_seen_ms: ts })
                .await
                .is_err()
            {
                warn!("offline transition listener dropped");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::tracker::PresenceTracker;

    fn setup() -> (Arc<MemoryKv>, PresenceTracker, Watchdog, mpsc::Receiver<OfflineTransition>) {
        let kv = Arc::new(MemoryKv::new());
        let tracker = PresenceTracker::new(kv.clone(), Duration::from_secs(30));
        let (tx, rx) = mpsc::channel(16);
        let watchdog = Watchdog::new(kv.clone(), WatchdogConfig::default(), tx);
        (kv, tracker, watchdog, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn reaps_lapsed_connections_and_emits_transition() {
        let (kv, tracker, watchdog, mut rx) = setup();
        tracker.mark_online("u", "c1").await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        watchdog.reconcile().await.unwrap();
        let transition = rx.try_recv().unwrap();
        assert_eq!(transition.user_id, "u");
        assert_eq!(kv.scard(&conn_set_key("u")).await.unwrap(), 0);
        assert_eq!(tracker.last_seen("u").await.unwrap(), Some(transition.last_seen_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn live_connections_survive_the_sweep() {
        let (_kv, tracker, watchdog, mut rx) = setup();
        tracker.mark_online("u", "c1").await.unwrap();

        watchdog.reconcile().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(tracker.is_user_online("u").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_disconnect_wins_the_last_seen_race() {
        let (kv, tracker, watchdog, mut rx) = setup();
        tracker.mark_online("u", "c1").await.unwrap();
        // Heartbeat lapses, but the set entry lingers and a clean
        // teardown records last-seen first.
        tokio::time::advance(Duration::from_secs(31)).await;
        kv.set(&last_seen_key("u"), "12345").await.unwrap();
        kv.sadd(&conn_set_key("u"), "c1").await.unwrap();

        watchdog.reconcile().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.last_seen("u").await.unwrap(), Some(12345));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_lapse_does_not_mark_offline() {
        let (_kv, tracker, watchdog, mut rx) = setup();
        tracker.mark_online("u", "c1").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.mark_online("u", "c2").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        // c1 lapsed, c2 still live.
        watchdog.reconcile().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(tracker.is_user_online("u").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_until_it_expires() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);
        let a = Watchdog::new(kv.clone(), WatchdogConfig::default(), tx_a);
        let b = Watchdog::new(kv.clone(), WatchdogConfig::default(), tx_b);

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        // The holder renews its own lock.
        assert!(a.try_acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(b.try_acquire().await.unwrap());
        assert!(!a.try_acquire().await.unwrap());
    }
}
