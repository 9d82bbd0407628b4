use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ConversationSummary;
use crate::models::Message;

/// Events sent over the WebSocket gateway. Delivery is per-user and
/// best-effort: a disconnected client learns of missed events through its
/// next poll, never through replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the subscription is registered
    Ready { user_id: Uuid },

    /// A message was appended to a conversation the user participates in
    MessageCreate {
        conversation_id: Uuid,
        message: Message,
    },

    /// Per-user conversation metadata changed (archive, read state, title)
    ConversationUpdate { conversation: ConversationSummary },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Subscribe the connection to the authenticated user's event stream.
    /// Must be the first frame; the token is the identity provider's JWT.
    Subscribe { token: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::Message;

    #[test]
    fn event_wire_shape_is_tagged() {
        let event = GatewayEvent::MessageCreate {
            conversation_id: Uuid::nil(),
            message: Message {
                id: Uuid::nil(),
                conversation_id: Uuid::nil(),
                from: Uuid::nil(),
                to: None,
                body: "hello".into(),
                created_at: Utc::now(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessageCreate");
        assert_eq!(json["data"]["message"]["body"], "hello");
    }

    #[test]
    fn subscribe_command_round_trips() {
        let raw = r#"{"type":"Subscribe","data":{"token":"abc"}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        let GatewayCommand::Subscribe { token } = cmd;
        assert_eq!(token, "abc");
    }
}
