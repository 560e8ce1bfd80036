use dashmap::DashMap;
use parley_proto::{ConnId, DialogueId, UserId};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Identity of a cancellable server-side timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Auto-clear for a typing indicator.
    Typing {
        user_id: UserId,
        dialogue_id: DialogueId,
    },
    /// Disconnect grace period before a connection is torn down.
    DisconnectGrace { user_id: UserId, conn_id: ConnId },
}

struct TimerEntry {
    generation: u64,
    // None during the window between registration and spawn.
    handle: Option<JoinHandle<()>>,
}

/// Registry of armed one-shot timers, owned by the server state and
/// injected wherever timers are needed. Re-arming a key cancels the
/// previous timer; a generation counter keeps a late-firing task from
/// clobbering its replacement.
#[derive(Default)]
pub struct TimerRegistry {
    timers: DashMap<TimerKey, TimerEntry>,
    next_generation: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer. `on_fire` runs only if the timer is
    /// still current when the delay elapses.
    pub fn arm<F, Fut>(self: &Arc<Self>, key: TimerKey, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        // Register before spawning: a zero-delay fire on another worker
        // must find its own entry, or it would stay armed forever.
        if let Some(old) = self.timers.insert(key.clone(), TimerEntry { generation, handle: None }) {
            if let Some(handle) = old.handle {
                handle.abort();
            }
        }
        let registry = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = registry
                .timers
                .remove_if(&task_key, |_, entry| entry.generation == generation)
                .is_some();
            if current {
                on_fire().await;
            }
        });
        if let Some(mut entry) = self.timers.get_mut(&key) {
            if entry.generation == generation {
                entry.handle = Some(handle);
            }
        }
    }

    /// Cancel a timer. Returns true when one was armed.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.timers.remove(key) {
            Some((_, entry)) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every typing timer held by a user. Returns the dialogues
    /// whose auto-clear was still pending, so the caller can broadcast
    /// the clear those timers will no longer deliver.
    pub fn cancel_typing_for(&self, user_id: &str) -> Vec<DialogueId> {
        let keys: Vec<TimerKey> = self
            .timers
            .iter()
            .filter(|e| matches!(e.key(), TimerKey::Typing { user_id: u, .. } if u == user_id))
            .map(|e| e.key().clone())
            .collect();
        let mut dialogues = Vec::new();
        for key in keys {
            if self.cancel(&key) {
                if let TimerKey::Typing { dialogue_id, .. } = key {
                    dialogues.push(dialogue_id);
                }
            }
        }
        dialogues
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.timers.contains_key(key)
    }
}
