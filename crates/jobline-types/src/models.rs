use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversation between two (or more) participants. Archive, hide and
/// read state are per-participant and live on the membership, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub title: Option<String>,
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub from: Uuid,
    /// Legacy 1:1 shorthand. Informational only; delivery always targets
    /// the full participant set.
    pub to: Option<Uuid>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Ordering key used everywhere a thread is rendered or stored:
    /// ascending `(created_at, id)`, id as the deterministic tiebreak.
    pub fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}
