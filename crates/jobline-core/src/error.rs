use jobline_db::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// `send` was called with neither a conversation id nor a recipient.
    #[error("a conversation id or recipient is required")]
    MissingRecipient,

    /// The acting user is not a participant of the conversation.
    #[error("user is not a participant of this conversation")]
    Forbidden,

    #[error(transparent)]
    Store(#[from] StoreError),
}
