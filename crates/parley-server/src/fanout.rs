//! Message fan-out: policy checks, envelope resolution, persistence and
//! broadcast for sends, edits and deletes.

use crate::delivery::DeliveryJob;
use crate::error::CoreError;
use crate::fabric::{device_group, dialogue_group, user_group};
use crate::{now_ms, App};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parley_proto::{
    Attachment, EnvelopeIn, ServerEvent, UserId, ENCRYPTED_PLACEHOLDER,
};
use parley_store::{Dialogue, NewMessage, StoredMessage};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A send request, shared by the socket and the JSON ingress.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub dialogue_id: String,
    pub is_encrypted: bool,
    pub content: Option<String>,
    pub encrypted_contents: Vec<EnvelopeIn>,
    pub attachments: Vec<Attachment>,
    pub self_destruct_at_ms: Option<u64>,
}

/// An edit request. Which field applies depends on the dialogue policy.
#[derive(Debug, Clone)]
pub struct EditMessage {
    pub content: Option<String>,
    pub encrypted_contents: Vec<EnvelopeIn>,
}

async fn load_dialogue_for(app: &App, dialogue_id: &str, user_id: &str) -> Result<Dialogue, CoreError> {
    let id = dialogue_id.to_string();
    let user = user_id.to_string();
    let (dialogue, member) = app
        .store
        .run(move |s| {
            let Some(d) = s.dialogue(&id)? else {
                return Err(parley_store::StoreError::DialogueNotFound);
            };
            let member = s.is_participant(&id, &user)?;
            Ok((d, member))
        })
        .await?;
    if !member {
        return Err(CoreError::Store(parley_store::StoreError::NotParticipant));
    }
    Ok(dialogue)
}

async fn recipients_of(app: &App, dialogue_id: &str, sender_id: &str) -> Result<Vec<UserId>, CoreError> {
    let id = dialogue_id.to_string();
    let participants = app.store.run(move |s| s.participants(&id)).await?;
    Ok(participants
        .into_iter()
        .map(|p| p.user_id)
        .filter(|u| u != sender_id)
        .collect())
}

async fn require_verified_device(app: &App, device_id: &str, user_id: &str) -> Result<(), CoreError> {
    let device = device_id.to_string();
    let user = user_id.to_string();
    let ok = app
        .store
        .run(move |s| s.is_device_verified(&device, &user, now_ms()))
        .await?;
    if ok { Ok(()) } else { Err(CoreError::DeviceUnverified) }
}

/// Resolve the surviving envelope set for a direct send: drop envelopes
/// addressed to devices that are not active devices of a recipient, and
/// collapse duplicates (the first occurrence per device wins).
async fn resolve_envelopes(
    app: &App,
    recipients: &[UserId],
    submitted: Vec<EnvelopeIn>,
) -> Result<Vec<EnvelopeIn>, CoreError> {
    let users = recipients.to_vec();
    let devices = app
        .store
        .run(move |s| s.active_devices_for_users(&users))
        .await?;
    let valid: HashSet<String> = devices.into_iter().map(|d| d.device_id).collect();

    let mut seen = HashSet::new();
    let surviving: Vec<EnvelopeIn> = submitted
        .into_iter()
        .filter(|env| valid.contains(&env.device_id) && seen.insert(env.device_id.clone()))
        .collect();
    if surviving.is_empty() {
        return Err(CoreError::EmptyEnvelopeSet);
    }
    Ok(surviving)
}

/// Send a chat message through the dialogue's encryption policy:
/// groups carry base64-wrapped plaintext broadcast to the dialogue,
/// direct dialogues carry per-recipient-device ciphertext envelopes.
pub async fn send_chat_message(
    app: &Arc<App>,
    sender_id: &str,
    sender_device: &str,
    input: SendMessage,
) -> Result<StoredMessage, CoreError> {
    let dialogue = load_dialogue_for(app, &input.dialogue_id, sender_id).await?;
    if dialogue.is_group && input.is_encrypted {
        return Err(CoreError::PolicyViolation(
            "group dialogues carry plaintext messages".into(),
        ));
    }
    if !dialogue.is_group && !input.is_encrypted {
        return Err(CoreError::PolicyViolation(
            "direct dialogues carry encrypted messages".into(),
        ));
    }
    if !dialogue.is_group || app.config.verify_group_senders {
        require_verified_device(app, sender_device, sender_id).await?;
    }

    let recipients = recipients_of(app, &dialogue.id, sender_id).await?;
    let (content, envelopes) = if dialogue.is_group {
        let plaintext = input
            .content
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CoreError::PolicyViolation("group message requires content".into()))?;
        (BASE64.encode(plaintext), Vec::new())
    } else {
        // Reject before anything is persisted: an empty surviving set
        // must not leave a shell message behind.
        let surviving = resolve_envelopes(app, &recipients, input.encrypted_contents).await?;
        (ENCRYPTED_PLACEHOLDER.to_string(), surviving)
    };

    let new = NewMessage {
        id: Uuid::new_v4().to_string(),
        dialogue_id: dialogue.id.clone(),
        sender_id: sender_id.to_string(),
        sender_device_id: Some(sender_device.to_string()),
        created_at_ms: now_ms(),
        content,
        attachments: input.attachments,
        self_destruct_at_ms: input.self_destruct_at_ms,
        system_event: None,
        envelopes: envelopes.clone(),
    };
    let stored = app.store.run(move |s| s.insert_message(new)).await?;

    if dialogue.is_group {
        let event = ServerEvent::ChatMessage {
            message: stored.to_out(false, None),
        };
        app.fabric.publish(&dialogue_group(&dialogue.id), &event).await;
    } else {
        for env in &envelopes {
            let event = ServerEvent::ChatMessage {
                message: stored.to_out(true, Some(&env.ciphertext)),
            };
            app.fabric.publish(&device_group(&env.device_id), &event).await;
        }
    }

    account_delivery(app, &stored, &recipients).await;
    sweep_self_destructed(app, sender_id).await;
    Ok(stored)
}

/// Relay a media reference through the same fan-out path. File messages
/// are plaintext in both dialogue kinds; the payload lives in external
/// storage behind the attachment URLs.
pub async fn send_file_message(
    app: &Arc<App>,
    sender_id: &str,
    dialogue_id: &str,
    attachments: Vec<Attachment>,
    content: Option<String>,
) -> Result<StoredMessage, CoreError> {
    let dialogue = load_dialogue_for(app, dialogue_id, sender_id).await?;
    if attachments.is_empty() {
        return Err(CoreError::InvalidFrame("file message requires attachments".into()));
    }
    let recipients = recipients_of(app, &dialogue.id, sender_id).await?;

    let new = NewMessage {
        id: Uuid::new_v4().to_string(),
        dialogue_id: dialogue.id.clone(),
        sender_id: sender_id.to_string(),
        sender_device_id: None,
        created_at_ms: now_ms(),
        content: content.as_deref().map(|c| BASE64.encode(c)).unwrap_or_default(),
        attachments,
        self_destruct_at_ms: None,
        system_event: None,
        envelopes: Vec::new(),
    };
    let stored = app.store.run(move |s| s.insert_message(new)).await?;

    let event = ServerEvent::FileMessage {
        message: stored.to_out(false, None),
    };
    app.fabric.publish(&dialogue_group(&dialogue.id), &event).await;

    account_delivery(app, &stored, &recipients).await;
    Ok(stored)
}

/// Edit a message. Only the sender may edit; for direct dialogues the
/// replacement envelope set swaps in atomically.
pub async fn edit_message(
    app: &Arc<App>,
    sender_id: &str,
    message_id: &str,
    input: EditMessage,
) -> Result<StoredMessage, CoreError> {
    let id = message_id.to_string();
    let existing = app
        .store
        .run(move |s| s.message(&id))
        .await?
        .ok_or(CoreError::Store(parley_store::StoreError::MessageNotFound))?;
    if existing.sender_id != sender_id {
        return Err(CoreError::NotMessageSender);
    }
    let dialogue = load_dialogue_for(app, &existing.dialogue_id, sender_id).await?;

    let (content, envelopes) = if dialogue.is_group {
        let plaintext = input
            .content
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CoreError::PolicyViolation("group edit requires content".into()))?;
        (Some(BASE64.encode(plaintext)), None)
    } else {
        let recipients = recipients_of(app, &dialogue.id, sender_id).await?;
        let surviving = resolve_envelopes(app, &recipients, input.encrypted_contents).await?;
        (None, Some(surviving))
    };

    let id = message_id.to_string();
    let env_clone = envelopes.clone();
    let edited = app
        .store
        .run(move |s| s.edit_message(&id, content.as_deref(), env_clone.as_deref(), now_ms()))
        .await?;

    if dialogue.is_group {
        let event = ServerEvent::EditMessage {
            message: edited.to_out(false, None),
        };
        app.fabric.publish(&dialogue_group(&dialogue.id), &event).await;
    } else if let Some(envelopes) = &envelopes {
        for env in envelopes {
            let event = ServerEvent::EditMessage {
                message: edited.to_out(true, Some(&env.ciphertext)),
            };
            app.fabric.publish(&device_group(&env.device_id), &event).await;
        }
    }
    Ok(edited)
}

/// Hide a message from the acting user's own view.
pub async fn soft_delete_message(
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
            if !s.is_participant(&m.dialogue_id, &user)? {
                return Err(parley_store::StoreError::NotParticipant);
            }
            s.soft_delete_message(&id, &user)
        })
        .await?;
    let event = ServerEvent::MessageSoftDeleted {
        message_id: message_id.to_string(),
        dialogue_id: message.dialogue_id,
        user_id: user_id.to_string(),
    };
    app.fabric.publish(&user_group(user_id), &event).await;
    Ok(())
}

/// Destroy a message for everyone. Sender only.
pub async fn hard_delete_message(
    app: &Arc<App>,
    user_id: &str,
    message_id: &str,
) -> Result<(), CoreError> {
    let id = message_id.to_string();
    let existing = app
        .store
        .run(move |s| s.message(&id))
        .await?
        .ok_or(CoreError::Store(parley_store::StoreError::MessageNotFound))?;
    if existing.sender_id != user_id {
        return Err(CoreError::NotMessageSender);
    }
    let id = message_id.to_string();
    let message = app.store.run(move |s| s.hard_delete_message(&id)).await?;
    let event = ServerEvent::MessageHardDeleted {
        message_id: message.id,
        dialogue_id: message.dialogue_id.clone(),
    };
    app.fabric.publish(&dialogue_group(&message.dialogue_id), &event).await;
    Ok(())
}

/// Post-send delivery bookkeeping: if any recipient is online, mark the
/// message delivered (once) and notify the sender; otherwise hand it to
/// the offline redelivery queue. A presence outage degrades to
/// assume-offline rather than failing the send.
async fn account_delivery(app: &Arc<App>, message: &StoredMessage, recipients: &[UserId]) {
    let any_online = match app.presence.is_online_many(recipients).await {
        Ok(flags) => flags.values().any(|v| *v),
        Err(e) => {
            warn!(err = %e, "presence check failed, assuming recipients offline");
            false
        }
    };
    if any_online {
        crate::delivery::mark_delivered_and_notify(app, message).await;
    } else if app
        .jobs
        .try_send(DeliveryJob::Deliver {
            message_id: message.id.clone(),
        })
        .is_err()
    {
        // The message stays Sent; the periodic sweep re-enqueues it.
        warn!(message = %message.id, "redelivery queue unavailable");
    }
}

/// Best-effort purge of the sender's expired self-destruct messages,
/// run opportunistically after each send.
async fn sweep_self_destructed(app: &Arc<App>, sender_id: &str) {
    let sender = sender_id.to_string();
    let purged = match app
        .store
        .run(move |s| s.purge_self_destructed(&sender, now_ms()))
        .await
    {
        Ok(purged) => purged,
        Err(e) => {
            warn!(err = %e, "self-destruct sweep failed");
            return;
        }
    };
    for (message_id, dialogue_id) in purged {
        debug!(message = %message_id, "self-destructed");
        let event = ServerEvent::MessageHardDeleted {
            message_id,
            dialogue_id: dialogue_id.clone(),
        };
        app.fabric.publish(&dialogue_group(&dialogue_id), &event).await;
    }
}
