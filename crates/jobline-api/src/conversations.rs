use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use jobline_types::api::{ArchiveRequest, Claims, SendMessageRequest};

use crate::AppState;
use crate::error::service_status;

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    #[serde(default)]
    pub include_archived: bool,
}

/// The acting user is always `claims.sub` from the auth middleware; no
/// handler accepts a caller-chosen "from".
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ConversationQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    // Run blocking store reads off the async runtime
    let service = state.service.clone();
    let user = claims.sub;

    let summaries = tokio::task::spawn_blocking(move || {
        service.conversations_for(user, query.include_archived)
    })
    .await
    .map_err(join_error)?
    .map_err(service_status)?;

    Ok(Json(summaries))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let service = state.service.clone();
    let user = claims.sub;

    let messages =
        tokio::task::spawn_blocking(move || service.messages_in(conversation_id, user))
            .await
            .map_err(join_error)?
            .map_err(service_status)?;

    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let service = state.service.clone();
    let from = claims.sub;

    let message = tokio::task::spawn_blocking(move || {
        service.send(
            req.conversation_id,
            from,
            req.to,
            &req.body,
            req.title.as_deref(),
        )
    })
    .await
    .map_err(join_error)?
    .map_err(service_status)?;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn set_archived(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ArchiveRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let service = state.service.clone();
    let user = claims.sub;

    let summary = tokio::task::spawn_blocking(move || {
        service.archive(conversation_id, user, req.archived)
    })
    .await
    .map_err(join_error)?
    .map_err(service_status)?;

    Ok(Json(summary))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let service = state.service.clone();
    let user = claims.sub;

    let summary = tokio::task::spawn_blocking(move || service.mark_read(conversation_id, user))
        .await
        .map_err(join_error)?
        .map_err(service_status)?;

    Ok(Json(summary))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let service = state.service.clone();
    let user = claims.sub;

    tokio::task::spawn_blocking(move || service.delete_for_user(conversation_id, user))
        .await
        .map_err(join_error)?
        .map_err(service_status)?;

    Ok(StatusCode::NO_CONTENT)
}

fn join_error(e: tokio::task::JoinError) -> StatusCode {
    error!("spawn_blocking join error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}
