//! Error taxonomy shared by every session backend.

use super::traits::SessionKey;
use thiserror::Error;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Unknown app, user or session id on a lookup scoped to one session.
    #[error("session not found: {0}")]
    NotFound(SessionKey),

    #[error("session already exists: {0}")]
    DuplicateSession(SessionKey),

    #[error("event {event_id} already recorded in session {session}")]
    DuplicateEvent {
        session: SessionKey,
        event_id: String,
    },

    /// Connectivity, transaction or timeout failure in a backend with external dependencies.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored state or event document could not be encoded or decoded.
    #[error("invalid stored state: {0}")]
    InvalidState(String),
}

impl SessionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateSession(_) | Self::DuplicateEvent { .. })
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidState(err.to_string())
    }
}
