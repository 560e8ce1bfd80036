use parley_proto::{
    Attachment, DeviceId, DialogueId, EnvelopeIn, MessageId, MessageOut, Role, UserId,
};

/// A conversation, either 1:1 (direct) or multi-party (group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialogue {
    pub id: DialogueId,
    pub slug: String,
    pub is_group: bool,
    pub last_message_id: Option<MessageId>,
    pub created_at_ms: u64,
}

/// (dialogue, user) membership association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub dialogue_id: DialogueId,
    pub user_id: UserId,
    pub role: Role,
    pub joined_at_ms: u64,
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub dialogue_id: DialogueId,
    pub sender_id: UserId,
    pub sender_device_id: Option<DeviceId>,
    pub created_at_ms: u64,
    pub edited_at_ms: Option<u64>,
    pub is_edited: bool,
    pub delivered: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub self_destruct_at_ms: Option<u64>,
    pub system_event: Option<String>,
}

impl StoredMessage {
    /// Wire representation. `is_encrypted` reflects the dialogue policy;
    /// `content_override` substitutes a per-device ciphertext.
    pub fn to_out(&self, is_encrypted: bool, content_override: Option<&str>) -> MessageOut {
        MessageOut {
            id: self.id.clone(),
            dialogue_id: self.dialogue_id.clone(),
            sender_id: self.sender_id.clone(),
            created_at_ms: self.created_at_ms,
            edited_at_ms: self.edited_at_ms,
            is_edited: self.is_edited,
            delivered: self.delivered,
            is_encrypted,
            content: content_override.unwrap_or(&self.content).to_string(),
            attachments: self.attachments.clone(),
            self_destruct_at_ms: self.self_destruct_at_ms,
            system_event: self.system_event.clone(),
        }
    }
}

/// Input for creating a message together with its envelopes, atomically.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub id: MessageId,
    pub dialogue_id: DialogueId,
    pub sender_id: UserId,
    pub sender_device_id: Option<DeviceId>,
    pub created_at_ms: u64,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub self_destruct_at_ms: Option<u64>,
    pub system_event: Option<String>,
    pub envelopes: Vec<EnvelopeIn>,
}

/// A per-device ciphertext row for a direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: MessageId,
    pub device_id: DeviceId,
    pub ciphertext: String,
}

/// Device key registration. Owned by the external key-verification
/// workflow; the core only reads it to gate sends and resolve fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKey {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub public_key: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub last_used_at_ms: Option<u64>,
    pub proof_expires_at_ms: Option<u64>,
}

/// Input for creating a dialogue with its initial membership.
#[derive(Debug, Clone)]
pub struct NewDialogue {
    pub id: DialogueId,
    pub slug: String,
    pub is_group: bool,
    /// Required for groups; must not be set for direct dialogues.
    pub founder: Option<UserId>,
    /// All members. For direct dialogues, exactly the two peers.
    pub members: Vec<UserId>,
    pub created_at_ms: u64,
}
