//! Synchronous JSON ingress. Every route feeds the same engine the
//! socket does; identity rides on `x-user-id` / `x-device-id` headers
//! set by the upstream authenticator.

use crate::error::CoreError;
use crate::fanout::{self, EditMessage, SendMessage};
use crate::session::{self, ws_handler};
use crate::{delivery, now_ms, roles, App};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parley_proto::{Attachment, EnvelopeIn, MessageOut};
use parley_store::{DeviceKey, NewDialogue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/dialogues", post(create_dialogue))
        .route("/api/dialogues/{id}", delete(delete_group))
        .route("/api/dialogues/{id}/read", post(mark_read))
        .route("/api/dialogues/{id}/participants", post(add_participant))
        .route("/api/dialogues/{id}/participants/{user}", delete(remove_participant))
        .route("/api/dialogues/{id}/promote", post(promote))
        .route("/api/dialogues/{id}/demote", post(demote))
        .route("/api/dialogues/{id}/resign", post(resign))
        .route("/api/dialogues/{id}/leave", post(leave))
        .route("/api/dialogues/{id}/transfer", post(transfer))
        .route("/api/messages", post(send_message))
        .route("/api/messages/{id}", delete(hard_delete_message))
        .route("/api/messages/{id}/hide", post(soft_delete_message))
        .route("/api/messages/{id}/edit", post(edit_message))
        .route("/api/messages/{id}/delivered", post(mark_delivered))
        .route("/api/files", post(send_file))
        .route("/api/devices", post(register_device))
        .route("/api/users/{id}/logout", post(logout_user))
        .with_state(app)
}

fn header(headers: &HeaderMap, name: &str) -> Result<String, CoreError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidFrame(format!("missing {name} header")))
}

fn ident(headers: &HeaderMap) -> Result<(String, String), CoreError> {
    Ok((header(headers, "x-user-id")?, header(headers, "x-device-id")?))
}

#[derive(Debug, Deserialize)]
struct CreateDialogueBody {
    #[serde(default)]
    id: Option<String>,
    slug: String,
    is_group: bool,
    #[serde(default)]
    founder: Option<String>,
    members: Vec<String>,
}

async fn create_dialogue(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<CreateDialogueBody>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    if !body.members.contains(&user_id) {
        return Err(CoreError::InvalidFrame(
            "creator must be listed among members".into(),
        ));
    }
    let new = NewDialogue {
        id: body.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        slug: body.slug,
        is_group: body.is_group,
        founder: body.founder,
        members: body.members,
        created_at_ms: now_ms(),
    };
    let dialogue = app.store.run(move |s| s.create_dialogue(new)).await?;
    Ok(Json(json!({
        "id": dialogue.id,
        "slug": dialogue.slug,
        "is_group": dialogue.is_group,
    })))
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    dialogue_id: String,
    is_encrypted: bool,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encrypted_contents: Vec<EnvelopeIn>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    self_destruct_at_ms: Option<u64>,
}

async fn send_message(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<MessageOut>, CoreError> {
    let (user_id, device_id) = ident(&headers)?;
    let is_encrypted = body.is_encrypted;
    let stored = fanout::send_chat_message(
        &app,
        &user_id,
        &device_id,
        SendMessage {
            dialogue_id: body.dialogue_id,
            is_encrypted,
            content: body.content,
            encrypted_contents: body.encrypted_contents,
            attachments: body.attachments,
            self_destruct_at_ms: body.self_destruct_at_ms,
        },
    )
    .await?;
    Ok(Json(stored.to_out(is_encrypted, None)))
}

#[derive(Debug, Deserialize)]
struct EditMessageBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encrypted_contents: Vec<EnvelopeIn>,
}

async fn edit_message(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<EditMessageBody>,
) -> Result<Json<MessageOut>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    let is_encrypted = body.content.is_none();
    let edited = fanout::edit_message(
        &app,
        &user_id,
        &id,
        EditMessage {
            content: body.content,
            encrypted_contents: body.encrypted_contents,
        },
    )
    .await?;
    Ok(Json(edited.to_out(is_encrypted, None)))
}

async fn soft_delete_message(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    fanout::soft_delete_message(&app, &user_id, &id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn hard_delete_message(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    fanout::hard_delete_message(&app, &user_id, &id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn mark_delivered(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    delivery::mark_delivered_by_recipient(&app, &user_id, &id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn mark_read(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    let newly_seen = delivery::mark_read(&app, &user_id, &id).await?;
    Ok(Json(json!({ "seen": newly_seen })))
}

#[derive(Debug, Deserialize)]
struct FileMessageBody {
    dialogue_id: String,
    attachments: Vec<Attachment>,
    #[serde(default)]
    content: Option<String>,
}

async fn send_file(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<FileMessageBody>,
) -> Result<Json<MessageOut>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    let stored =
        fanout::send_file_message(&app, &user_id, &body.dialogue_id, body.attachments, body.content)
            .await?;
    Ok(Json(stored.to_out(false, None)))
}

#[derive(Debug, Deserialize)]
struct TargetBody {
    user_id: String,
}

async fn add_participant(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TargetBody>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::add_participant(&app, &id, &user_id, &body.user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn remove_participant(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path((id, target)): Path<(String, String)>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::remove_participant(&app, &id, &user_id, &target).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn promote(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TargetBody>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::promote_to_elder(&app, &id, &user_id, &body.user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn demote(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TargetBody>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::demote_elder(&app, &id, &user_id, &body.user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn resign(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::resign_elder(&app, &id, &user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn leave(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::leave_group(&app, &id, &user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn transfer(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TargetBody>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::transfer_founder(&app, &id, &user_id, &body.user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_group(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    roles::delete_group(&app, &id, &user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Administrative forced logout: every live session of the user is torn
/// down immediately, skipping the disconnect grace period.
async fn logout_user(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, CoreError> {
    ident(&headers)?;
    session::force_logout(&app, &id).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceBody {
    device_id: String,
    public_key: String,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    is_verified: bool,
    #[serde(default)]
    proof_expires_at_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Registration ingress for the external key-verification workflow.
async fn register_device(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<RegisterDeviceBody>,
) -> Result<Json<Value>, CoreError> {
    let (user_id, _) = ident(&headers)?;
    let key = DeviceKey {
        device_id: body.device_id,
        user_id,
        public_key: body.public_key,
        is_active: body.is_active,
        is_verified: body.is_verified,
        last_used_at_ms: Some(now_ms()),
        proof_expires_at_ms: body.proof_expires_at_ms,
    };
    app.store.run(move |s| s.upsert_device_key(&key)).await?;
    Ok(Json(json!({ "ok": true })))
}
