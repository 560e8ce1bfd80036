//! Delivery and read state: Sent → Delivered (once) → per-recipient
//! Read, plus the offline redelivery worker and the undelivered sweep.

use crate::error::CoreError;
use crate::fabric::{dialogue_group, user_group};
use crate::App;
use parley_proto::{MessageId, ServerEvent};
use parley_store::{Dialogue, StoredMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Work item for the offline redelivery worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryJob {
    Deliver { message_id: MessageId },
}

/// Transition a message to Delivered and, only on the first transition,
/// notify the sender's sessions. Replays are silent no-ops.
pub async fn mark_delivered_and_notify(app: &Arc<App>, message: &StoredMessage) {
    let id = message.id.clone();
    match app.store.run(move |s| s.mark_delivered(&id)).await {
        Ok(true) => {
            let event = ServerEvent::MarkAsDelivered {
                message_id: message.id.clone(),
                dialogue_id: message.dialogue_id.clone(),
            };
            app.fabric.publish(&user_group(&message.sender_id), &event).await;
        }
        Ok(false) => {}
        Err(e) => warn!(err = %e, message = %message.id, "delivered transition failed"),
    }
}

/// Recipient-side delivery acknowledgement (JSON ingress).
pub async fn mark_delivered_by_recipient(
    app: &Arc<App>,
    user_id: &str,
    message_id: &str,
) -> Result<(), CoreError> {
    let id = message_id.to_string();
    let user = user_id.to_string();
    let message = app
        .store
        .run(move |s| {
            let m = s
                .message(&id)?
                .ok_or(parley_store::StoreError::MessageNotFound)?;
            if m.sender_id == user || !s.is_participant(&m.dialogue_id, &user)? {
                return Err(parley_store::StoreError::NotParticipant);
            }
            Ok(m)
        })
        .await?;
    mark_delivered_and_notify(app, &message).await;
    Ok(())
}

/// Bulk mark-as-read for a dialogue. Returns the newly-seen message
/// ids; replays produce no events.
pub async fn mark_read(
    app: &Arc<App>,
    user_id: &str,
    dialogue_id: &str,
) -> Result<Vec<MessageId>, CoreError> {
    let id = dialogue_id.to_string();
    let user = user_id.to_string();
    let (newly_seen, unread) = app
        .store
        .run(move |s| {
            if !s.is_participant(&id, &user)? {
                return Err(parley_store::StoreError::NotParticipant);
            }
            let newly = s.mark_seen_bulk(&id, &user)?;
            let unread = s.unread_count(&id, &user)?;
            Ok((newly, unread))
        })
        .await?;
    if newly_seen.is_empty() {
        return Ok(newly_seen);
    }

    let update = ServerEvent::UnreadCountUpdate {
        dialogue_id: dialogue_id.to_string(),
        unread,
    };
    app.fabric.publish(&user_group(user_id), &update).await;

    let receipts = ServerEvent::MarkAsRead {
        dialogue_id: dialogue_id.to_string(),
        user_id: user_id.to_string(),
        message_ids: newly_seen.clone(),
    };
    app.fabric.publish(&dialogue_group(dialogue_id), &receipts).await;
    Ok(newly_seen)
}

/// Connect-time catch-up: push every undelivered message addressed to
/// the user down the fresh session, marking each delivered.
pub async fn deliver_pending(
    app: &Arc<App>,
    user_id: &str,
    device_id: &str,
    tx: &mpsc::Sender<ServerEvent>,
) -> Result<(), CoreError> {
    let user = user_id.to_string();
    let pending = app.store.run(move |s| s.undelivered_for_user(&user)).await?;
    if pending.is_empty() {
        return Ok(());
    }
    debug!(user = user_id, count = pending.len(), "delivering queued messages");

    let mut dialogues: HashMap<String, Dialogue> = HashMap::new();
    for message in pending {
        let dialogue = match dialogues.get(&message.dialogue_id) {
            Some(d) => d.clone(),
            None => {
                let id = message.dialogue_id.clone();
                let Some(d) = app.store.run(move |s| s.dialogue(&id)).await? else {
                    continue;
                };
                dialogues.insert(message.dialogue_id.clone(), d.clone());
                d
            }
        };

        let out = if dialogue.is_group {
            message.to_out(false, None)
        } else {
            let mid = message.id.clone();
            let dev = device_id.to_string();
            match app.store.run(move |s| s.envelope_for_device(&mid, &dev)).await? {
                Some(env) => message.to_out(true, Some(&env.ciphertext)),
                // No envelope addressed to this device; another of the
                // user's devices will pick the message up.
                None => continue,
            }
        };
        if tx.send(ServerEvent::ChatMessage { message: out }).await.is_err() {
            break;
        }
        mark_delivered_and_notify(app, &message).await;
    }
    Ok(())
}

/// The offline redelivery worker. Each job re-checks recipient liveness
/// before acting; messages to still-offline users are dropped here and
/// caught by the next connect or the sweep.
pub fn spawn_worker(app: Arc<App>, mut rx: mpsc::Receiver<DeliveryJob>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("offline redelivery worker started");
        while let Some(DeliveryJob::Deliver { message_id }) = rx.recv().await {
            if let Err(e) = process_job(&app, &message_id).await {
                warn!(err = %e, message = %message_id, "redelivery job failed");
            }
        }
    })
}

async fn process_job(app: &Arc<App>, message_id: &str) -> Result<(), CoreError> {
    let id = message_id.to_string();
    let Some(message) = app.store.run(move |s| s.message(&id)).await? else {
        return Ok(());
    };
    if message.delivered {
        return Ok(());
    }
    let dialogue_id = message.dialogue_id.clone();
    let participants = app
        .store
        .run(move |s| s.participants(&dialogue_id))
        .await?;
    let recipients: Vec<String> = participants
        .into_iter()
        .map(|p| p.user_id)
        .filter(|u| *u != message.sender_id)
        .collect();

    let any_online = app
        .presence
        .is_online_many(&recipients)
        .await
        .map(|flags| flags.values().any(|v| *v))
        .unwrap_or(false);
    if any_online {
        mark_delivered_and_notify(app, &message).await;
    } else {
        debug!(message = %message.id, "recipients still offline, dropping job");
    }
    Ok(())
}

/// Periodic re-enqueue of messages still Sent. Covers jobs lost to a
/// full queue or a restart.
pub fn spawn_undelivered_sweep(app: Arc<App>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(app.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race server startup.
        interval.tick().await;
        loop {
            interval.tick().await;
            let batch = app.config.sweep_batch;
            let ids = match app.store.run(move |s| s.undelivered_message_ids(batch)).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(err = %e, "undelivered sweep query failed");
                    continue;
                }
            };
            for message_id in ids {
                if app.jobs.try_send(DeliveryJob::Deliver { message_id }).is_err() {
                    break;
                }
            }
        }
    })
}
