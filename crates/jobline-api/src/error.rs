use axum::http::StatusCode;
use tracing::error;

use jobline_core::ServiceError;
use jobline_db::StoreError;

/// Map service failures onto the REST surface. Validation problems are the
/// caller's fault, membership problems are forbidden, and everything
/// storage-shaped is logged and reported as a generic 500.
pub fn service_status(err: ServiceError) -> StatusCode {
    match err {
        ServiceError::MissingRecipient => StatusCode::BAD_REQUEST,
        ServiceError::Forbidden => StatusCode::FORBIDDEN,
        ServiceError::Store(store) => match store {
            StoreError::InvalidParticipants | StoreError::EmptyBody => StatusCode::BAD_REQUEST,
            StoreError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::NotParticipant { .. } => StatusCode::FORBIDDEN,
            StoreError::LockPoisoned | StoreError::Storage(_) => {
                error!("store failure: {}", store);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}
