use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = String;
pub type DeviceId = String;
pub type DialogueId = String;
pub type MessageId = String;
pub type ConnId = String;

/// Maximum size of a single JSON text frame on the socket (64 KiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Content stored for direct messages in place of plaintext. The real
/// payload lives in per-device envelopes.
pub const ENCRYPTED_PLACEHOLDER: &str = "[encrypted]";

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Privilege role of a group participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Elder,
    Founder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Participant => "participant",
            Role::Elder => "elder",
            Role::Founder => "founder",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "participant" => Some(Role::Participant),
            "elder" => Some(Role::Elder),
            "founder" => Some(Role::Founder),
            _ => None,
        }
    }

    /// Founders and elders may manage group membership.
    pub fn can_manage_members(&self) -> bool {
        matches!(self, Role::Founder | Role::Elder)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Structured rejection codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("sender device is not verified")]
    DeviceUnverified,
    #[error("not a participant of this dialogue")]
    NotParticipant,
    #[error("dialogue not found")]
    DialogueNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("payload shape violates dialogue encryption policy")]
    PolicyViolation,
    #[error("no valid per-device envelopes remain")]
    EmptyEnvelopeSet,
    #[error("role transition not permitted")]
    RoleViolation,
    #[error("only the sender may modify a message")]
    NotMessageSender,
    #[error("malformed frame")]
    InvalidFrame,
    #[error("storage unavailable")]
    StoreUnavailable,
}

// ---------------------------------------------------------------------------
// Payload fragments
// ---------------------------------------------------------------------------

/// One per-recipient-device ciphertext submitted with a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeIn {
    pub device_id: DeviceId,
    pub ciphertext: String,
}

/// A media reference attached to a message. Storage and URL signing are
/// external; the core only routes the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Message representation broadcast to clients. For direct messages,
/// `content` carries the ciphertext addressed to the receiving device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOut {
    pub id: MessageId,
    pub dialogue_id: DialogueId,
    pub sender_id: UserId,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at_ms: Option<u64>,
    pub is_edited: bool,
    pub delivered: bool,
    pub is_encrypted: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_destruct_at_ms: Option<u64>,
    /// Set on synthetic membership notices (`group_added`, `founder_transferred`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_event: Option<String>,
}

// ---------------------------------------------------------------------------
// Client → server events
// ---------------------------------------------------------------------------

/// Events a client may send over the real-time socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Heartbeat reply; refreshes the connection's presence TTL.
    Pong,
    TypingStatus {
        dialogue_id: DialogueId,
        is_typing: bool,
    },
    ChatMessage {
        dialogue_id: DialogueId,
        is_encrypted: bool,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        encrypted_contents: Vec<EnvelopeIn>,
        #[serde(default)]
        attachments: Vec<Attachment>,
        /// Self-destruct deadline, absolute millis. Best-effort sweep.
        #[serde(default)]
        self_destruct_at_ms: Option<u64>,
    },
    EditMessage {
        message_id: MessageId,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        encrypted_contents: Vec<EnvelopeIn>,
    },
    SoftDeleteMessage {
        message_id: MessageId,
    },
    HardDeleteMessage {
        message_id: MessageId,
    },
    MarkAsRead {
        dialogue_id: DialogueId,
    },
    /// Batch online check for everyone in a dialogue.
    RequestOnlineStatus {
        dialogue_id: DialogueId,
    },
    FileMessage {
        dialogue_id: DialogueId,
        attachments: Vec<Attachment>,
        #[serde(default)]
        content: Option<String>,
    },
    UploadCanceled {
        dialogue_id: DialogueId,
        upload_id: String,
    },
    FileUploadStatus {
        dialogue_id: DialogueId,
        upload_id: String,
        status: String,
    },
    RecordingStatus {
        dialogue_id: DialogueId,
        is_recording: bool,
    },
}

// ---------------------------------------------------------------------------
// Server → client events
// ---------------------------------------------------------------------------

/// Events the server broadcasts to subscribed connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Heartbeat probe; clients answer with `pong`.
    Ping,
    UserOnlineStatus {
        user_id: UserId,
        is_online: bool,
    },
    UserLastSeen {
        user_id: UserId,
        last_seen_ms: u64,
    },
    /// Batch reply to `request_online_status`.
    OnlineStatus {
        dialogue_id: DialogueId,
        statuses: Vec<(UserId, bool)>,
    },
    ChatMessage {
        message: MessageOut,
    },
    MarkAsDelivered {
        message_id: MessageId,
        dialogue_id: DialogueId,
    },
    MarkAsRead {
        dialogue_id: DialogueId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    TypingStatusBroadcast {
        dialogue_id: DialogueId,
        user_id: UserId,
        is_typing: bool,
    },
    EditMessage {
        message: MessageOut,
    },
    MessageSoftDeleted {
        message_id: MessageId,
        dialogue_id: DialogueId,
        user_id: UserId,
    },
    MessageHardDeleted {
        message_id: MessageId,
        dialogue_id: DialogueId,
    },
    FileMessage {
        message: MessageOut,
    },
    FileUploadStatus {
        dialogue_id: DialogueId,
        user_id: UserId,
        upload_id: String,
        status: String,
    },
    UploadCanceled {
        dialogue_id: DialogueId,
        user_id: UserId,
        upload_id: String,
    },
    RecordingStatus {
        dialogue_id: DialogueId,
        user_id: UserId,
        is_recording: bool,
    },
    GroupAdded {
        dialogue_id: DialogueId,
        user_id: UserId,
    },
    GroupRemoved {
        dialogue_id: DialogueId,
        user_id: UserId,
    },
    GroupLeft {
        dialogue_id: DialogueId,
        user_id: UserId,
    },
    FounderTransferred {
        dialogue_id: DialogueId,
        old_founder: UserId,
        new_founder: UserId,
    },
    GroupDeleted {
        dialogue_id: DialogueId,
    },
    UnreadCountUpdate {
        dialogue_id: DialogueId,
        unread: u64,
    },
    /// Tears down every session of the addressed user immediately,
    /// skipping the disconnect grace period.
    ForceLogout {
        user_id: UserId,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}
