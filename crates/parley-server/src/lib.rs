//! The conversation server runtime.
//!
//! Ties the persistent store, the presence layer and the in-process
//! broadcast fabric together under one [`App`] state, and exposes the
//! WebSocket and JSON ingress that drive the fan-out engine.

pub mod api;
pub mod delivery;
pub mod error;
pub mod fabric;
pub mod fanout;
pub mod roles;
pub mod session;
pub mod timers;
pub mod typing;

pub use error::CoreError;

use crate::delivery::DeliveryJob;
use crate::fabric::Fabric;
use crate::timers::TimerRegistry;
use parley_presence::PresenceTracker;
use parley_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tunables for the runtime. Every timing knob the engine uses lives
/// here; nothing is hardcoded at a use site.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TTL on per-connection presence heartbeats.
    pub heartbeat_ttl: Duration,
    /// Grace period after a socket drops before the user goes offline.
    pub grace_period: Duration,
    /// Auto-clear deadline for typing indicators.
    pub typing_timeout: Duration,
    /// Interval of the undelivered-message sweep.
    pub sweep_interval: Duration,
    /// Messages re-enqueued per sweep pass.
    pub sweep_batch: usize,
    /// Require a verified sender device for group sends too (direct
    /// sends always require one).
    pub verify_group_senders: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(300),
            sweep_batch: 256,
            verify_group_senders: false,
        }
    }
}

/// Shared server state.
pub struct App {
    pub store: Store,
    pub presence: PresenceTracker,
    pub fabric: Fabric,
    pub timers: Arc<TimerRegistry>,
    pub jobs: mpsc::Sender<DeliveryJob>,
    pub config: ServerConfig,
}

impl App {
    /// Assemble the state. The returned receiver feeds the offline
    /// redelivery worker ([`delivery::spawn_worker`]).
    pub fn new(
        store: Store,
        presence: PresenceTracker,
        config: ServerConfig,
    ) -> (Arc<Self>, mpsc::Receiver<DeliveryJob>) {
        let (jobs, jobs_rx) = mpsc::channel(1024);
        let app = Arc::new(Self {
            store,
            presence,
            fabric: Fabric::new(),
            timers: Arc::new(TimerRegistry::new()),
            jobs,
            config,
        });
        (app, jobs_rx)
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
