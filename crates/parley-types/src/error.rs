use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Every failure the messaging core can surface to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("cannot start a conversation with yourself")]
    SelfConversation,

    /// Backend or network unavailable. Safe to retry.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// A true constraint violation, not an upsert race.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable machine-readable name of a [`ChatError`], used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    SelfConversation,
    Transient,
    Conflict,
    Unauthorized,
    Internal,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::SelfConversation => ErrorKind::SelfConversation,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Rebuild an error from its wire form.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => Self::Validation(message),
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Forbidden => Self::Forbidden(message),
            ErrorKind::SelfConversation => Self::SelfConversation,
            ErrorKind::Transient => Self::Transient(message),
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::Unauthorized => Self::Unauthorized,
            ErrorKind::Internal => Self::Internal(message),
        }
    }

    /// The detail text without the variant prefix added by `Display`.
    pub fn detail(&self) -> String {
        match self {
            Self::Validation(m)
            | Self::NotFound(m)
            | Self::Forbidden(m)
            | Self::Transient(m)
            | Self::Conflict(m)
            | Self::Internal(m) => m.clone(),
            Self::SelfConversation | Self::Unauthorized => self.to_string(),
        }
    }
}
