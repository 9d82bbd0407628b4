use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// JWT claims shared across jobline-api (REST middleware) and
/// jobline-gateway (WebSocket subscribe frame). Canonical definition lives
/// here in jobline-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Conversations --

/// One conversation as seen by a specific viewer: title resolved against
/// the viewer (falls back to the other participant's display name), plus
/// that viewer's own archive flag and unread count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub title: Option<String>,
    pub display_title: String,
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
    pub unread: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveRequest {
    pub archived: bool,
}

// -- Messages --

/// `conversation_id` absent means "start or reuse the conversation with
/// `to`"; present-but-unknown is an error, never an implicit create.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub conversation_id: Option<Uuid>,
    pub to: Option<Uuid>,
    pub body: String,
    pub title: Option<String>,
}
