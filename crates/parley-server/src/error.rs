use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_presence::PresenceError;
use parley_proto::ErrorCode;
use parley_store::StoreError;
use thiserror::Error;

/// Rejections produced by the conversation engine. Library errors from
/// the store and presence layers fold in transparently.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("sender device is not verified")]
    DeviceUnverified,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("no valid per-device envelopes remain")]
    EmptyEnvelopeSet,

    #[error("only the sender may modify the message")]
    NotMessageSender,

    #[error("malformed request: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl CoreError {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            CoreError::DeviceUnverified => ErrorCode::DeviceUnverified,
            CoreError::PolicyViolation(_) => ErrorCode::PolicyViolation,
            CoreError::EmptyEnvelopeSet => ErrorCode::EmptyEnvelopeSet,
            CoreError::NotMessageSender => ErrorCode::NotMessageSender,
            CoreError::InvalidFrame(_) => ErrorCode::InvalidFrame,
            CoreError::Store(e) => e.to_error_code(),
            CoreError::Presence(_) => ErrorCode::StoreUnavailable,
        }
    }

    fn status(&self) -> StatusCode {
        match self.to_error_code() {
            ErrorCode::DeviceUnverified => StatusCode::FORBIDDEN,
            ErrorCode::NotParticipant
            | ErrorCode::RoleViolation
            | ErrorCode::NotMessageSender => StatusCode::FORBIDDEN,
            ErrorCode::DialogueNotFound | ErrorCode::MessageNotFound => StatusCode::NOT_FOUND,
            ErrorCode::PolicyViolation
            | ErrorCode::EmptyEnvelopeSet
            | ErrorCode::InvalidFrame => StatusCode::BAD_REQUEST,
            ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_error_code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
