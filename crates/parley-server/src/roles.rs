//! Group role orchestration: store-level transitions plus the system
//! messages and broadcasts each one produces.

use crate::error::CoreError;
use crate::fabric::{dialogue_group, user_group};
use crate::{now_ms, App};
use parley_proto::ServerEvent;
use parley_store::{NewMessage, RoleChange, StoreError};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Persist and broadcast a synthetic membership notice.
async fn post_system(app: &Arc<App>, dialogue_id: &str, actor: &str, tag: &str, text: &str) {
    let new = NewMessage {
        id: Uuid::new_v4().to_string(),
        dialogue_id: dialogue_id.to_string(),
        sender_id: actor.to_string(),
        sender_device_id: None,
        created_at_ms: now_ms(),
        content: text.to_string(),
        attachments: Vec::new(),
        self_destruct_at_ms: None,
        system_event: Some(tag.to_string()),
        envelopes: Vec::new(),
    };
    match app.store.run(move |s| s.insert_message(new)).await {
        Ok(stored) => {
            let event = ServerEvent::ChatMessage {
                message: stored.to_out(false, None),
            };
            app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
        }
        Err(e) => tracing::warn!(err = %e, "system message insert failed"),
    }
}

/// Attach a user's live sessions to a dialogue group they just joined.
fn graft_sessions(app: &App, dialogue_id: &str, user_id: &str) {
    for (conn_id, tx) in app.fabric.members(&user_group(user_id)) {
        app.fabric.subscribe(&dialogue_group(dialogue_id), &conn_id, tx);
    }
}

/// Detach a user's live sessions from a dialogue they no longer belong to.
fn detach_sessions(app: &App, dialogue_id: &str, user_id: &str) {
    for (conn_id, _) in app.fabric.members(&user_group(user_id)) {
        app.fabric.unsubscribe(&dialogue_group(dialogue_id), &conn_id);
    }
}

pub async fn promote_to_elder(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
    target: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a, t) = owned3(dialogue_id, actor, target);
    let change = app.store.run(move |s| s.promote_to_elder(&d, &a, &t)).await?;
    post_system(app, dialogue_id, actor, "elder_promoted", &format!("{target} is now an elder")).await;
    Ok(change)
}

pub async fn demote_elder(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
    target: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a, t) = owned3(dialogue_id, actor, target);
    let change = app.store.run(move |s| s.demote_elder(&d, &a, &t)).await?;
    post_system(app, dialogue_id, actor, "elder_demoted", &format!("{target} is no longer an elder")).await;
    Ok(change)
}

pub async fn resign_elder(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a) = (dialogue_id.to_string(), actor.to_string());
    let change = app.store.run(move |s| s.resign_elder(&d, &a)).await?;
    post_system(app, dialogue_id, actor, "elder_resigned", &format!("{actor} stepped down as elder")).await;
    Ok(change)
}

pub async fn add_participant(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
    target: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a, t) = owned3(dialogue_id, actor, target);
    let change = app
        .store
        .run(move |s| s.add_participant(&d, &a, &t, now_ms()))
        .await?;
    graft_sessions(app, dialogue_id, target);
    post_system(app, dialogue_id, actor, "group_added", &format!("{target} joined the group")).await;
    let event = ServerEvent::GroupAdded {
        dialogue_id: dialogue_id.to_string(),
        user_id: target.to_string(),
    };
    app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
    app.fabric.publish(&user_group(target), &event).await;
    Ok(change)
}

pub async fn remove_participant(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
    target: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a, t) = owned3(dialogue_id, actor, target);
    let change = app.store.run(move |s| s.remove_participant(&d, &a, &t)).await?;
    post_system(app, dialogue_id, actor, "group_removed", &format!("{target} was removed from the group")).await;
    let event = ServerEvent::GroupRemoved {
        dialogue_id: dialogue_id.to_string(),
        user_id: target.to_string(),
    };
    app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
    app.fabric.publish(&user_group(target), &event).await;
    detach_sessions(app, dialogue_id, target);
    Ok(change)
}

pub async fn leave_group(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a) = (dialogue_id.to_string(), actor.to_string());
    let change = app.store.run(move |s| s.leave_group(&d, &a)).await?;
    post_system(app, dialogue_id, actor, "group_left", &format!("{actor} left the group")).await;
    let event = ServerEvent::GroupLeft {
        dialogue_id: dialogue_id.to_string(),
        user_id: actor.to_string(),
    };
    app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
    detach_sessions(app, dialogue_id, actor);
    Ok(change)
}

pub async fn transfer_founder(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
    new_founder: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a, t) = owned3(dialogue_id, actor, new_founder);
    let change = app.store.run(move |s| s.transfer_founder(&d, &a, &t)).await?;
    info!(dialogue = dialogue_id, from = actor, to = new_founder, "founder transferred");
    post_system(
        app,
        dialogue_id,
        actor,
        "founder_transferred",
        &format!("{new_founder} is now the founder"),
    )
    .await;
    let event = ServerEvent::FounderTransferred {
        dialogue_id: dialogue_id.to_string(),
        old_founder: actor.to_string(),
        new_founder: new_founder.to_string(),
    };
    app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
    Ok(change)
}

/// Delete the whole group. Founder only; anyone else gets a denial and
/// the group sees a system notice about the attempt.
pub async fn delete_group(
    app: &Arc<App>,
    dialogue_id: &str,
    actor: &str,
) -> Result<RoleChange, CoreError> {
    let (d, a) = (dialogue_id.to_string(), actor.to_string());
    match app.store.run(move |s| s.delete_group(&d, &a)).await {
        Ok(change) => {
            let event = ServerEvent::GroupDeleted {
                dialogue_id: dialogue_id.to_string(),
            };
            app.fabric.publish(&dialogue_group(dialogue_id), &event).await;
            app.fabric.drop_group(&dialogue_group(dialogue_id));
            Ok(change)
        }
        Err(StoreError::RoleViolation(reason)) => {
            post_system(
                app,
                dialogue_id,
                actor,
                "delete_denied",
                &format!("{actor} attempted to delete the group"),
            )
            .await;
            Err(CoreError::Store(StoreError::RoleViolation(reason)))
        }
        Err(e) => Err(e.into()),
    }
}

fn owned3(a: &str, b: &str, c: &str) -> (String, String, String) {
    (a.to_string(), b.to_string(), c.to_string())
}
