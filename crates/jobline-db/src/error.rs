use thiserror::Error;
use uuid::Uuid;

/// Store-level failure taxonomy. Validation errors are rejected before
/// anything is written; `Storage` wraps everything SQLite-shaped.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("at least two distinct participants are required")]
    InvalidParticipants,

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("user {user} is not a participant of conversation {conversation}")]
    NotParticipant { conversation: Uuid, user: Uuid },

    #[error("message body is empty")]
    EmptyBody,

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
