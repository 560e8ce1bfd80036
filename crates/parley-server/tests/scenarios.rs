//! End-to-end flows over the in-memory store and presence backends.

use parley_presence::{MemoryKv, PresenceTracker, Watchdog, WatchdogConfig};
use parley_proto::{EnvelopeIn, ErrorCode, Role, ServerEvent};
use parley_server::delivery::{self, DeliveryJob};
use parley_server::fabric::{device_group, dialogue_group, user_group};
use parley_server::fanout::{self, SendMessage};
use parley_server::{roles, App, ServerConfig};
use parley_store::{DeviceKey, NewDialogue, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn build_app(config: ServerConfig) -> (Arc<App>, mpsc::Receiver<DeliveryJob>, Arc<MemoryKv>) {
    let store = Store::open(None).unwrap();
    let kv = Arc::new(MemoryKv::new());
    let presence = PresenceTracker::new(kv.clone(), config.heartbeat_ttl);
    let (app, jobs_rx) = App::new(store, presence, config);
    (app, jobs_rx, kv)
}

fn register_device(app: &App, device_id: &str, user_id: &str) {
    app.store
        .blocking()
        .upsert_device_key(&DeviceKey {
            device_id: device_id.into(),
            user_id: user_id.into(),
            public_key: "pk".into(),
            is_active: true,
            is_verified: true,
            last_used_at_ms: None,
            proof_expires_at_ms: None,
        })
        .unwrap();
}

fn seed_direct(app: &App) {
    app.store
        .blocking()
        .create_dialogue(NewDialogue {
            id: "d1".into(),
            slug: "a-b".into(),
            is_group: false,
            founder: None,
            members: vec!["a".into(), "b".into()],
            created_at_ms: 1_000,
        })
        .unwrap();
    register_device(app, "dev-a", "a");
    register_device(app, "dev-b", "b");
}

fn seed_group(app: &App) {
    app.store
        .blocking()
        .create_dialogue(NewDialogue {
            id: "g1".into(),
            slug: "the-group".into(),
            is_group: true,
            founder: Some("f".into()),
            members: vec!["f".into(), "e".into(), "p".into()],
            created_at_ms: 1_000,
        })
        .unwrap();
    register_device(app, "dev-f", "f");
}

fn direct_send(ciphertext: &str) -> SendMessage {
    SendMessage {
        dialogue_id: "d1".into(),
        is_encrypted: true,
        content: None,
        encrypted_contents: vec![EnvelopeIn {
            device_id: "dev-b".into(),
            ciphertext: ciphertext.into(),
        }],
        attachments: Vec::new(),
        self_destruct_at_ms: None,
    }
}

fn founder_count(app: &App, dialogue_id: &str) -> usize {
    app.store
        .blocking()
        .participants(dialogue_id)
        .unwrap()
        .iter()
        .filter(|p| p.role == Role::Founder)
        .count()
}

/// A direct message sent while the recipient is offline stays Sent,
/// is delivered on their next connect, and a later read produces
/// receipts exactly once.
#[tokio::test]
async fn offline_direct_message_delivered_on_reconnect_then_read() {
    let (app, mut jobs_rx, _kv) = build_app(ServerConfig::default());
    seed_direct(&app);

    let (sender_tx, mut sender_rx) = mpsc::channel(16);
    app.fabric.subscribe(&user_group("a"), "conn-a", sender_tx.clone());
    app.fabric.subscribe(&dialogue_group("d1"), "conn-a", sender_tx);

    let stored = fanout::send_chat_message(&app, "a", "dev-a", direct_send("ct-hello"))
        .await
        .unwrap();
    assert!(!app.store.blocking().message(&stored.id).unwrap().unwrap().delivered);
    assert!(matches!(jobs_rx.try_recv(), Ok(DeliveryJob::Deliver { .. })));

    // The recipient connects: presence up, queued delivery flows down
    // the fresh session channel.
    app.presence.mark_online("b", "conn-b").await.unwrap();
    let (b_tx, mut b_rx) = mpsc::channel(16);
    app.fabric.subscribe(&user_group("b"), "conn-b", b_tx.clone());
    app.fabric.subscribe(&device_group("dev-b"), "conn-b", b_tx.clone());
    app.fabric.subscribe(&dialogue_group("d1"), "conn-b", b_tx.clone());
    delivery::deliver_pending(&app, "b", "dev-b", &b_tx).await.unwrap();

    match b_rx.try_recv().unwrap() {
        ServerEvent::ChatMessage { message } => {
            assert_eq!(message.id, stored.id);
            assert_eq!(message.content, "ct-hello");
            assert!(message.is_encrypted);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(app.store.blocking().message(&stored.id).unwrap().unwrap().delivered);
    assert!(matches!(sender_rx.try_recv(), Ok(ServerEvent::MarkAsDelivered { .. })));

    // Read once: receipts; read again: silence.
    let newly = delivery::mark_read(&app, "b", "d1").await.unwrap();
    assert_eq!(newly, vec![stored.id.clone()]);
    let mut saw_receipt = false;
    while let Ok(ev) = sender_rx.try_recv() {
        if matches!(&ev, ServerEvent::MarkAsRead { message_ids, .. } if *message_ids == vec![stored.id.clone()]) {
            saw_receipt = true;
        }
    }
    assert!(saw_receipt);
    assert!(delivery::mark_read(&app, "b", "d1").await.unwrap().is_empty());
    assert_eq!(app.store.blocking().seen_by(&stored.id).unwrap(), vec!["b".to_string()]);
}

/// Founder transfer hands the crown to an elder; the old founder can
/// then leave like any participant. Exactly one founder at every step.
#[tokio::test]
async fn founder_transfer_then_old_founder_leaves() {
    let (app, _jobs, _kv) = build_app(ServerConfig::default());
    seed_group(&app);

    roles::promote_to_elder(&app, "g1", "f", "e").await.unwrap();
    assert_eq!(founder_count(&app, "g1"), 1);

    roles::transfer_founder(&app, "g1", "f", "e").await.unwrap();
    assert_eq!(founder_count(&app, "g1"), 1);
    assert_eq!(
        app.store.blocking().participant_role("g1", "e").unwrap(),
        Some(Role::Founder)
    );
    assert_eq!(
        app.store.blocking().participant_role("g1", "f").unwrap(),
        Some(Role::Participant)
    );

    // Demoted to participant, the old founder may simply leave.
    roles::leave_group(&app, "g1", "f").await.unwrap();
    assert_eq!(app.store.blocking().participant_role("g1", "f").unwrap(), None);
    assert_eq!(founder_count(&app, "g1"), 1);
    assert!(app.store.blocking().is_dialogue_deleted_for("g1", "f").unwrap());
}

/// A plain participant can neither remove the founder nor delete the
/// group; both denials leave state intact and the delete attempt is
/// visible to the group.
#[tokio::test]
async fn participant_denied_founder_removal_and_group_delete() {
    let (app, _jobs, _kv) = build_app(ServerConfig::default());
    seed_group(&app);
    let (tx, mut rx) = mpsc::channel(16);
    app.fabric.subscribe(&dialogue_group("g1"), "conn-e", tx);

    let err = roles::remove_participant(&app, "g1", "p", "f").await.unwrap_err();
    assert_eq!(err.to_error_code(), ErrorCode::RoleViolation);

    let err = roles::delete_group(&app, "g1", "p").await.unwrap_err();
    assert_eq!(err.to_error_code(), ErrorCode::RoleViolation);

    assert!(app.store.blocking().dialogue("g1").unwrap().is_some());
    assert_eq!(
        app.store.blocking().participant_role("g1", "f").unwrap(),
        Some(Role::Founder)
    );

    let mut saw_denial_notice = false;
    while let Ok(ev) = rx.try_recv() {
        if let ServerEvent::ChatMessage { message } = ev {
            if message.system_event.as_deref() == Some("delete_denied") {
                saw_denial_notice = true;
            }
        }
    }
    assert!(saw_denial_notice);
}

/// A connection that dies without a clean disconnect is reaped by the
/// watchdog within one tick of its heartbeat lapsing, and last-seen is
/// recorded exactly once.
#[tokio::test(start_paused = true)]
async fn watchdog_reaps_crashed_connection() {
    let config = ServerConfig {
        heartbeat_ttl: Duration::from_secs(30),
        ..ServerConfig::default()
    };
    let (app, _jobs, kv) = build_app(config);
    seed_direct(&app);

    let (offline_tx, mut offline_rx) = mpsc::channel(4);
    let watchdog = Watchdog::new(
        kv,
        WatchdogConfig {
            tick: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(30),
        },
        offline_tx,
    );

    app.presence.mark_online("a", "conn-a").await.unwrap();
    assert!(app.presence.is_user_online("a").await.unwrap());

    // The heartbeat lapses with no mark_offline ever arriving.
    tokio::time::advance(Duration::from_secs(31)).await;
    watchdog.reconcile().await.unwrap();

    let transition = offline_rx.try_recv().unwrap();
    assert_eq!(transition.user_id, "a");
    assert_eq!(
        app.presence.last_seen("a").await.unwrap(),
        Some(transition.last_seen_ms)
    );
    assert!(!app.presence.is_user_online("a").await.unwrap());

    // Reconnecting clears the stale last-seen.
    app.presence.mark_online("a", "conn-a2").await.unwrap();
    assert_eq!(app.presence.last_seen("a").await.unwrap(), None);
}

/// The delivered transition is first-writer-wins across every path
/// that can race for it.
#[tokio::test]
async fn delivered_transition_is_exactly_once_across_paths() {
    let (app, jobs_rx, _kv) = build_app(ServerConfig::default());
    seed_direct(&app);

    let (sender_tx, mut sender_rx) = mpsc::channel(16);
    app.fabric.subscribe(&user_group("a"), "conn-a", sender_tx);

    let stored = fanout::send_chat_message(&app, "a", "dev-a", direct_send("ct"))
        .await
        .unwrap();

    // Path 1: recipient ack. Path 2: connect-time scan. Path 3: worker.
    delivery::mark_delivered_by_recipient(&app, "b", &stored.id).await.unwrap();
    let (b_tx, _b_rx) = mpsc::channel(16);
    delivery::deliver_pending(&app, "b", "dev-b", &b_tx).await.unwrap();
    app.presence.mark_online("b", "conn-b").await.unwrap();
    let worker = delivery::spawn_worker(app.clone(), jobs_rx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.abort();

    let mut notifications = 0;
    while let Ok(ev) = sender_rx.try_recv() {
        if matches!(ev, ServerEvent::MarkAsDelivered { .. }) {
            notifications += 1;
        }
    }
    assert_eq!(notifications, 1);
}

/// Group messages reach the dialogue as base64-wrapped plaintext and
/// a removed member's live session stops receiving them.
#[tokio::test]
async fn removed_member_stops_receiving_group_traffic() {
    let (app, _jobs, _kv) = build_app(ServerConfig::default());
    seed_group(&app);

    let (p_tx, mut p_rx) = mpsc::channel(16);
    app.fabric.subscribe(&user_group("p"), "conn-p", p_tx.clone());
    app.fabric.subscribe(&dialogue_group("g1"), "conn-p", p_tx);

    roles::remove_participant(&app, "g1", "f", "p").await.unwrap();
    while p_rx.try_recv().is_ok() {}

    fanout::send_chat_message(
        &app,
        "f",
        "dev-f",
        SendMessage {
            dialogue_id: "g1".into(),
            is_encrypted: false,
            content: Some("after removal".into()),
            encrypted_contents: Vec::new(),
            attachments: Vec::new(),
            self_destruct_at_ms: None,
        },
    )
    .await
    .unwrap();

    assert!(p_rx.try_recv().is_err());

    let err = fanout::send_chat_message(
        &app,
        "p",
        "dev-p",
        SendMessage {
            dialogue_id: "g1".into(),
            is_encrypted: false,
            content: Some("let me back in".into()),
            encrypted_contents: Vec::new(),
            attachments: Vec::new(),
            self_destruct_at_ms: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_error_code(), ErrorCode::NotParticipant);
}
