use parley_proto::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("dialogue not found")]
    DialogueNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("user is not a participant of the dialogue")]
    NotParticipant,

    #[error("role violation: {0}")]
    RoleViolation(String),

    #[error("invalid dialogue: {0}")]
    InvalidDialogue(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("store unavailable")]
    Unavailable,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Map to the wire-level rejection code.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            StoreError::DialogueNotFound => ErrorCode::DialogueNotFound,
            StoreError::MessageNotFound => ErrorCode::MessageNotFound,
            StoreError::NotParticipant => ErrorCode::NotParticipant,
            StoreError::RoleViolation(_) => ErrorCode::RoleViolation,
            StoreError::InvalidDialogue(_) => ErrorCode::InvalidFrame,
            StoreError::LockPoisoned
            | StoreError::Unavailable
            | StoreError::Sqlite(_)
            | StoreError::Serde(_) => ErrorCode::StoreUnavailable,
        }
    }
}
