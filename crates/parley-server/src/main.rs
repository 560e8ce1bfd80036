use anyhow::{Context, Result};
use clap::Parser;
use parley_presence::{MemoryKv, PresenceKv, PresenceTracker, RedisKv, Watchdog, WatchdogConfig};
use parley_server::{api, delivery, session, App, ServerConfig};
use parley_store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

#[derive(Parser, Debug)]
#[command(author, version, about = "parley real-time conversation server")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
    /// SQLite database path. Omit for an in-memory store.
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Redis URL for the presence store. Omit for the in-memory backend
    /// (single-process deployments only).
    #[arg(long)]
    redis_url: Option<String>,
    /// Per-connection heartbeat TTL, milliseconds.
    #[arg(long, default_value = "60000")]
    heartbeat_ttl_ms: u64,
    /// Presence watchdog reconciliation interval, milliseconds.
    #[arg(long, default_value = "30000")]
    watchdog_tick_ms: u64,
    /// Watchdog leader lock TTL, milliseconds.
    #[arg(long, default_value = "90000")]
    watchdog_lock_ttl_ms: u64,
    /// Disconnect grace period before a user goes offline, milliseconds.
    #[arg(long, default_value = "30000")]
    grace_ms: u64,
    /// Typing indicator auto-clear deadline, milliseconds.
    #[arg(long, default_value = "10000")]
    typing_timeout_ms: u64,
    /// Undelivered-message sweep interval, milliseconds.
    #[arg(long, default_value = "300000")]
    sweep_interval_ms: u64,
    /// Require verified sender devices for group sends as well.
    #[arg(long)]
    verify_group_senders: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid --listen {}", args.listen))?;

    let config = ServerConfig {
        heartbeat_ttl: Duration::from_millis(args.heartbeat_ttl_ms),
        grace_period: Duration::from_millis(args.grace_ms),
        typing_timeout: Duration::from_millis(args.typing_timeout_ms),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        verify_group_senders: args.verify_group_senders,
        ..ServerConfig::default()
    };

    let store = Store::open(args.db_path.as_deref()).context("failed to open database")?;

    let kv: Arc<dyn PresenceKv> = match &args.redis_url {
        Some(url) => Arc::new(
            RedisKv::connect(url)
                .await
                .with_context(|| format!("failed to connect to redis at {url}"))?,
        ),
        None => {
            tracing::warn!("no --redis-url given, using in-process presence store");
            Arc::new(MemoryKv::new())
        }
    };
    // Offline transitions from both reap paths (watchdog sweep and
    // tracker ghost pruning) funnel into one broadcast consumer.
    let (offline_tx, mut offline_rx) = mpsc::channel(256);
    let presence = PresenceTracker::new(kv.clone(), config.heartbeat_ttl)
        .with_offline_notifications(offline_tx.clone());

    let (app, jobs_rx) = App::new(store, presence, config);
    delivery::spawn_worker(app.clone(), jobs_rx);
    delivery::spawn_undelivered_sweep(app.clone());

    Watchdog::new(
        kv,
        WatchdogConfig {
            tick: Duration::from_millis(args.watchdog_tick_ms),
            lock_ttl: Duration::from_millis(args.watchdog_lock_ttl_ms),
        },
        offline_tx,
    )
    .spawn();
    {
        let app = app.clone();
        tokio::spawn(async move {
            while let Some(transition) = offline_rx.recv().await {
                session::broadcast_offline(&app, &transition.user_id, transition.last_seen_ms)
                    .await;
            }
        });
    }

    let router = api::router(app).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        "parley-server listening addr={} heartbeat_ttl={}ms grace={}ms watchdog_tick={}ms",
        listener.local_addr()?,
        args.heartbeat_ttl_ms,
        args.grace_ms,
        args.watchdog_tick_ms,
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server failed")?;

    Ok(())
}
