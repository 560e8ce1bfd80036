//! WebSocket sessions: Connecting → Active → Draining → Closed.
//!
//! One task reads client frames, one task owns the socket sink and
//! forwards everything published to this connection's channel. Presence
//! heartbeats ride on JSON ping/pong frames; a dropped socket arms a
//! grace timer instead of tearing presence down immediately.

use crate::delivery::deliver_pending;
use crate::error::CoreError;
use crate::fabric::{device_group, dialogue_group, user_group};
use crate::timers::TimerKey;
use crate::App;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parley_proto::{ClientEvent, ErrorCode, ServerEvent, MAX_FRAME_BYTES};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Authenticated user id (identity is established upstream).
    pub user: String,
    /// The connecting device.
    pub device: String,
    /// Client-supplied connection id; reusing one within the grace
    /// period resumes the previous session's presence.
    #[serde(default)]
    pub conn: Option<String>,
}

pub async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_session(app, socket, query))
}

async fn run_session(app: Arc<App>, socket: WebSocket, query: WsQuery) {
    let user_id = query.user;
    let device_id = query.device;
    let conn_id = query.conn.unwrap_or_else(|| Uuid::new_v4().to_string());

    let grace_key = TimerKey::DisconnectGrace {
        user_id: user_id.clone(),
        conn_id: conn_id.clone(),
    };
    if app.timers.cancel(&grace_key) {
        debug!(user = %user_id, conn = %conn_id, "reconnected within grace period");
    }
    info!(user = %user_id, device = %device_id, conn = %conn_id, "session active");

    let (tx, mut rx) = mpsc::channel::<ServerEvent>(256);

    if let Err(e) = app.presence.mark_online(&user_id, &conn_id).await {
        // Presence outage must not kill the connection.
        warn!(err = %e, user = %user_id, "presence mark-online failed");
    }

    let dialogue_ids = {
        let user = user_id.clone();
        app.store
            .run(move |s| s.dialogue_ids_for_user(&user))
            .await
            .unwrap_or_else(|e| {
                warn!(err = %e, user = %user_id, "dialogue subscription scan failed");
                Vec::new()
            })
    };
    app.fabric.subscribe(&user_group(&user_id), &conn_id, tx.clone());
    app.fabric.subscribe(&device_group(&device_id), &conn_id, tx.clone());
    for dialogue_id in &dialogue_ids {
        app.fabric.subscribe(&dialogue_group(dialogue_id), &conn_id, tx.clone());
    }

    let online = ServerEvent::UserOnlineStatus {
        user_id: user_id.clone(),
        is_online: true,
    };
    for dialogue_id in &dialogue_ids {
        app.fabric
            .publish_excluding(&dialogue_group(dialogue_id), &online, Some(&conn_id))
            .await;
    }

    if let Err(e) = deliver_pending(&app, &user_id, &device_id, &tx).await {
        warn!(err = %e, user = %user_id, "queued delivery failed");
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: forwards this connection's channel and emits heartbeat
    // pings. Returns true when the session was force-logged-out.
    let ping_interval = app.config.heartbeat_ttl / 3;
    let mut write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        loop {
            tokio::select! {
                ev = rx.recv() => {
                    let Some(ev) = ev else { return false };
                    let forced = matches!(ev, ServerEvent::ForceLogout { .. });
                    let Ok(json) = serde_json::to_string(&ev) else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        return false;
                    }
                    if forced {
                        return true;
                    }
                }
                _ = ping.tick() => {
                    let Ok(json) = serde_json::to_string(&ServerEvent::Ping) else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        return false;
                    }
                }
            }
        }
    });

    let forced_logout = loop {
        tokio::select! {
            res = &mut write_task => break res.unwrap_or(false),
            frame = ws_rx.next() => {
                let Some(Ok(message)) = frame else { break false };
                match message {
                    Message::Text(text) => {
                        if text.len() > MAX_FRAME_BYTES {
                            send_error(&tx, ErrorCode::InvalidFrame, "frame too large").await;
                            continue;
                        }
                        let event = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                send_error(&tx, ErrorCode::InvalidFrame, &e.to_string()).await;
                                continue;
                            }
                        };
                        if !dispatch(&app, &user_id, &device_id, &conn_id, &tx, event).await {
                            break false;
                        }
                    }
                    Message::Close(_) => break false,
                    _ => {}
                }
            }
        }
    };
    write_task.abort();

    // Draining. Typing indicators clear immediately; the socket that
    // would have reset them is gone.
    crate::typing::clear_on_disconnect(&app, &user_id).await;
    app.fabric.unsubscribe_all(&conn_id);
    if forced_logout {
        info!(user = %user_id, conn = %conn_id, "forced logout, skipping grace period");
        finalize_offline(&app, &user_id, &conn_id).await;
    } else {
        debug!(user = %user_id, conn = %conn_id, "draining, grace timer armed");
        let app2 = app.clone();
        let user = user_id.clone();
        let conn = conn_id.clone();
        app.timers.clone().arm(grace_key, app.config.grace_period, move || async move {
            finalize_offline(&app2, &user, &conn).await;
        });
    }
}

/// Handle one client event. Returns false when the session must close
/// (expired heartbeat).
async fn dispatch(
    app: &Arc<App>,
    user_id: &str,
    device_id: &str,
    conn_id: &str,
    tx: &mpsc::Sender<ServerEvent>,
    event: ClientEvent,
) -> bool {
    match event {
        ClientEvent::Pong => match app.presence.refresh(user_id, conn_id).await {
            Ok(true) => true,
            Ok(false) => {
                info!(user = %user_id, conn = %conn_id, "heartbeat expired, closing session");
                false
            }
            Err(e) => {
                warn!(err = %e, "heartbeat refresh failed");
                true
            }
        },
        ClientEvent::TypingStatus { dialogue_id, is_typing } => {
            report(tx, crate::typing::handle_typing(app, user_id, &dialogue_id, is_typing).await)
                .await;
            true
        }
        ClientEvent::ChatMessage {
            dialogue_id,
            is_encrypted,
            content,
            encrypted_contents,
            attachments,
            self_destruct_at_ms,
        } => {
            let input = crate::fanout::SendMessage {
                dialogue_id,
                is_encrypted,
                content,
                encrypted_contents,
                attachments,
                self_destruct_at_ms,
            };
            match crate::fanout::send_chat_message(app, user_id, device_id, input).await {
                Ok(stored) => {
                    if is_encrypted {
                        // The sender holds no envelope; echo the shell so
                        // the client learns the message id.
                        let echo = ServerEvent::ChatMessage {
                            message: stored.to_out(true, None),
                        };
                        tx.send(echo).await.ok();
                    }
                }
                Err(e) => send_core_error(tx, e).await,
            }
            true
        }
        ClientEvent::EditMessage { message_id, content, encrypted_contents } => {
            let input = crate::fanout::EditMessage { content, encrypted_contents };
            report(tx, crate::fanout::edit_message(app, user_id, &message_id, input).await.map(|_| ()))
                .await;
            true
        }
        ClientEvent::SoftDeleteMessage { message_id } => {
            report(tx, crate::fanout::soft_delete_message(app, user_id, &message_id).await).await;
            true
        }
        ClientEvent::HardDeleteMessage { message_id } => {
            report(tx, crate::fanout::hard_delete_message(app, user_id, &message_id).await).await;
            true
        }
        ClientEvent::MarkAsRead { dialogue_id } => {
            report(tx, crate::delivery::mark_read(app, user_id, &dialogue_id).await.map(|_| ()))
                .await;
            true
        }
        ClientEvent::RequestOnlineStatus { dialogue_id } => {
            report(tx, online_status(app, user_id, &dialogue_id, tx).await).await;
            true
        }
        ClientEvent::FileMessage { dialogue_id, attachments, content } => {
            report(
                tx,
                crate::fanout::send_file_message(app, user_id, &dialogue_id, attachments, content)
                    .await
                    .map(|_| ()),
            )
            .await;
            true
        }
        ClientEvent::UploadCanceled { dialogue_id, upload_id } => {
            let event = ServerEvent::UploadCanceled {
                dialogue_id: dialogue_id.clone(),
                user_id: user_id.to_string(),
                upload_id,
            };
            report(tx, relay(app, user_id, &dialogue_id, event).await).await;
            true
        }
        ClientEvent::FileUploadStatus { dialogue_id, upload_id, status } => {
            let event = ServerEvent::FileUploadStatus {
                dialogue_id: dialogue_id.clone(),
                user_id: user_id.to_string(),
                upload_id,
                status,
            };
            report(tx, relay(app, user_id, &dialogue_id, event).await).await;
            true
        }
        ClientEvent::RecordingStatus { dialogue_id, is_recording } => {
            let event = ServerEvent::RecordingStatus {
                dialogue_id: dialogue_id.clone(),
                user_id: user_id.to_string(),
                is_recording,
            };
            report(tx, relay(app, user_id, &dialogue_id, event).await).await;
            true
        }
    }
}

/// Membership-checked pass-through broadcast to a dialogue.
async fn relay(
    app: &Arc<App>,
    user_id: &str,
    dialogue_id: &str,
    event: ServerEvent,
) -> Result<(), CoreError> {
    let d = dialogue_id.to_string();
    let u = user_id.to_string();
    if !app.store.run(move |s| s.is_participant(&d, &u)).await? {
        return Err(CoreError::Store(parley_store::StoreError::NotParticipant));
    }
    app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
    Ok(())
}

/// Batch presence reply for a dialogue's participants.
async fn online_status(
    app: &Arc<App>,
    user_id: &str,
    dialogue_id: &str,
    tx: &mpsc::Sender<ServerEvent>,
) -> Result<(), CoreError> {
    let d = dialogue_id.to_string();
    let u = user_id.to_string();
    let participants = app
        .store
        .run(move |s| {
            if !s.is_participant(&d, &u)? {
                return Err(parley_store::StoreError::NotParticipant);
            }
            s.participants(&d)
        })
        .await?;
    let users: Vec<String> = participants.into_iter().map(|p| p.user_id).collect();
    let flags = app.presence.is_online_many(&users).await?;
    let statuses = users
        .into_iter()
        .map(|u| {
            let online = flags.get(&u).copied().unwrap_or(false);
            (u, online)
        })
        .collect();
    tx.send(ServerEvent::OnlineStatus {
        dialogue_id: dialogue_id.to_string(),
        statuses,
    })
    .await
    .ok();
    Ok(())
}

async fn report(tx: &mpsc::Sender<ServerEvent>, result: Result<(), CoreError>) {
    if let Err(e) = result {
        send_core_error(tx, e).await;
    }
}

async fn send_core_error(tx: &mpsc::Sender<ServerEvent>, e: CoreError) {
    send_error(tx, e.to_error_code(), &e.to_string()).await;
}

async fn send_error(tx: &mpsc::Sender<ServerEvent>, code: ErrorCode, message: &str) {
    tx.send(ServerEvent::Error {
        code,
        message: message.to_string(),
    })
    .await
    .ok();
}

/// Publish a forced-logout signal to every session of a user. Each
/// session's write task forwards the event to its client and returns,
/// which tears the session down without a grace period.
pub async fn force_logout(app: &Arc<App>, user_id: &str) {
    info!(user = %user_id, "forced logout requested");
    let event = ServerEvent::ForceLogout {
        user_id: user_id.to_string(),
    };
    app.fabric.publish(&user_group(user_id), &event).await;
}

/// Final presence teardown for a connection. Broadcasts offline +
/// last-seen only when this was the user's last connection.
pub async fn finalize_offline(app: &Arc<App>, user_id: &str, conn_id: &str) {
    match app.presence.mark_offline(user_id, conn_id).await {
        Ok(Some(last_seen_ms)) => broadcast_offline(app, user_id, last_seen_ms).await,
        Ok(None) => {}
        Err(e) => warn!(err = %e, user = %user_id, "presence mark-offline failed"),
    }
}

/// Tell every dialogue the user participates in that they went offline.
pub async fn broadcast_offline(app: &Arc<App>, user_id: &str, last_seen_ms: u64) {
    let user = user_id.to_string();
    let dialogue_ids = match app.store.run(move |s| s.dialogue_ids_for_user(&user)).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(err = %e, user = %user_id, "offline broadcast scan failed");
            return;
        }
    };
    let offline = ServerEvent::UserOnlineStatus {
        user_id: user_id.to_string(),
        is_online: false,
    };
    let last_seen = ServerEvent::UserLastSeen {
        user_id: user_id.to_string(),
        last_seen_ms,
    };
    for dialogue_id in dialogue_ids {
        let group = dialogue_group(&dialogue_id);
        app.fabric.publish(&group, &offline).await;
        app.fabric.publish(&group, &last_seen).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{app, seed_direct};

    #[tokio::test]
    async fn offline_broadcast_reaches_every_dialogue() {
        let (app, _jobs) = app();
        seed_direct(&app);
        let (tx, mut rx) = mpsc::channel(8);
        app.fabric.subscribe(&dialogue_group("d1"), "conn-b", tx);

        app.presence.mark_online("a", "conn-a").await.unwrap();
        finalize_offline(&app, "a", "conn-a").await;

        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::UserOnlineStatus { is_online: false, .. })
        ));
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::UserLastSeen { .. })));
    }

    #[tokio::test]
    async fn second_connection_keeps_user_online() {
        let (app, _jobs) = app();
        seed_direct(&app);
        let (tx, mut rx) = mpsc::channel(8);
        app.fabric.subscribe(&dialogue_group("d1"), "conn-b", tx);

        app.presence.mark_online("a", "c1").await.unwrap();
        app.presence.mark_online("a", "c2").await.unwrap();
        finalize_offline(&app, "a", "c1").await;

        // Still online on c2: no broadcast.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn force_logout_reaches_every_session_of_the_user() {
        let (app, _jobs) = app();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (other_tx, mut other_rx) = mpsc::channel(8);
        app.fabric.subscribe(&user_group("a"), "c1", tx1);
        app.fabric.subscribe(&user_group("a"), "c2", tx2);
        app.fabric.subscribe(&user_group("b"), "c3", other_tx);

        force_logout(&app, "a").await;
        assert!(matches!(rx1.try_recv(), Ok(ServerEvent::ForceLogout { .. })));
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::ForceLogout { .. })));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn online_status_reply_is_membership_checked() {
        let (app, _jobs) = app();
        seed_direct(&app);
        let (tx, mut rx) = mpsc::channel(8);

        let err = online_status(&app, "stranger", "d1", &tx).await.unwrap_err();
        assert_eq!(err.to_error_code(), ErrorCode::NotParticipant);

        app.presence.mark_online("b", "conn-b").await.unwrap();
        online_status(&app, "a", "d1", &tx).await.unwrap();
        match rx.try_recv().unwrap() {
            ServerEvent::OnlineStatus { statuses, .. } => {
                assert!(statuses.contains(&("b".to_string(), true)));
                assert!(statuses.contains(&("a".to_string(), false)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
