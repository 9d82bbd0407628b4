use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use jobline_db::Database;
use jobline_db::models::{ConversationRow, MemberRow, MessageRow};
use jobline_gateway::Dispatcher;
use jobline_types::api::ConversationSummary;
use jobline_types::events::GatewayEvent;
use jobline_types::models::{Conversation, Message};

use crate::directory::ProfileDirectory;
use crate::error::ServiceError;

/// Business rules over the store: find-or-create conversations, append
/// messages, per-user archive/hide/read state, and post-commit fan-out.
/// The service is the only writer; the gateway and REST layers are thin
/// shells around it.
#[derive(Clone)]
pub struct MessagingService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    directory: Arc<dyn ProfileDirectory>,
}

impl MessagingService {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        directory: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            directory,
        }
    }

    /// Idempotent find-or-create for a participant pair. Concurrent first
    /// contact from both sides resolves to a single conversation; the
    /// loser of the race gets the winner's record, never an error.
    pub fn start_or_get_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        title: Option<&str>,
    ) -> Result<Conversation, ServiceError> {
        let (row, created) = self.db.find_or_create_conversation(user_a, user_b, title)?;
        if created {
            debug!("created conversation {} for ({}, {})", row.id, user_a, user_b);
        }
        self.conversation_from_row(&row)
    }

    /// Append a message. With no conversation id the conversation with
    /// `to` is started or reused; an explicit id that does not exist stays
    /// an error, preserving the no-id/bad-id distinction. On success the
    /// message is fanned out to every participant's live connections.
    pub fn send(
        &self,
        conversation_id: Option<Uuid>,
        from: Uuid,
        to: Option<Uuid>,
        body: &str,
        title: Option<&str>,
    ) -> Result<Message, ServiceError> {
        let conversation_id = match conversation_id {
            Some(id) => {
                self.db.get_conversation(id)?;
                id
            }
            None => {
                let recipient = to.ok_or(ServiceError::MissingRecipient)?;
                let (row, _) = self.db.find_or_create_conversation(from, recipient, title)?;
                parse_uuid(&row.id, "conversation")
            }
        };

        let row = self.db.append_message(conversation_id, from, to, body)?;
        let message = message_from_row(&row);

        // Fan-out after commit, best effort: delivery targets the full
        // member set, never the legacy `to` field. A crash between commit
        // and publish is healed by the next poll.
        for member in self.db.members_of(conversation_id)? {
            let user = parse_uuid(&member.user_id, "member");
            self.dispatcher.publish_to_user(
                user,
                GatewayEvent::MessageCreate {
                    conversation_id,
                    message: message.clone(),
                },
            );
        }

        Ok(message)
    }

    /// Per-user archive flag. Does not touch the other participants' view.
    pub fn archive(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        archived: bool,
    ) -> Result<ConversationSummary, ServiceError> {
        self.require_member(conversation_id, user_id)?;
        self.db.set_archived(conversation_id, user_id, archived)?;

        let summary = self.summary_for(conversation_id, user_id)?;
        self.dispatcher.publish_to_user(
            user_id,
            GatewayEvent::ConversationUpdate {
                conversation: summary.clone(),
            },
        );
        Ok(summary)
    }

    /// Delete-for-user: hides the conversation from this user's lists from
    /// now on. History and the other side are untouched; other sessions of
    /// this user converge on their next poll.
    pub fn delete_for_user(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), ServiceError> {
        self.require_member(conversation_id, user_id)?;
        self.db.set_hidden(conversation_id, user_id)?;
        Ok(())
    }

    /// Mark the whole conversation read for this user.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<ConversationSummary, ServiceError> {
        self.require_member(conversation_id, user_id)?;
        self.db.set_last_read(conversation_id, user_id)?;

        let summary = self.summary_for(conversation_id, user_id)?;
        self.dispatcher.publish_to_user(
            user_id,
            GatewayEvent::ConversationUpdate {
                conversation: summary.clone(),
            },
        );
        Ok(summary)
    }

    /// The viewer's conversation list, newest activity first.
    pub fn conversations_for(
        &self,
        user_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<ConversationSummary>, ServiceError> {
        let rows = self.db.list_conversations(user_id, include_archived)?;
        rows.iter()
            .map(|(conversation, member)| self.build_summary(conversation, member))
            .collect()
    }

    /// Full thread, ascending `(created_at, id)`. Participants only.
    pub fn messages_in(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Message>, ServiceError> {
        self.require_member(conversation_id, user_id)?;
        let rows = self.db.list_messages(conversation_id)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub fn summary_for(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<ConversationSummary, ServiceError> {
        let row = self.db.get_conversation(conversation_id)?;
        let member = self
            .db
            .member(conversation_id, user_id)?
            .ok_or(ServiceError::Forbidden)?;
        self.build_summary(&row, &member)
    }

    fn require_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), ServiceError> {
        self.db.get_conversation(conversation_id)?;
        match self.db.member(conversation_id, user_id)? {
            Some(_) => Ok(()),
            None => Err(ServiceError::Forbidden),
        }
    }

    fn conversation_from_row(&self, row: &ConversationRow) -> Result<Conversation, ServiceError> {
        let id = parse_uuid(&row.id, "conversation");
        let participants = self.participants_of(id)?;
        Ok(Conversation {
            id,
            participants,
            title: row.title.clone(),
            last_message: row.last_message.clone(),
            created_at: parse_timestamp(&row.created_at, "conversation"),
            updated_at: parse_timestamp(&row.updated_at, "conversation"),
        })
    }

    fn build_summary(
        &self,
        row: &ConversationRow,
        member: &MemberRow,
    ) -> Result<ConversationSummary, ServiceError> {
        let id = parse_uuid(&row.id, "conversation");
        let viewer = parse_uuid(&member.user_id, "member");
        let participants = self.participants_of(id)?;
        let unread = self.db.unread_count(id, viewer)?;

        let display_title = match &row.title {
            Some(title) => title.clone(),
            None => self.peer_label(&participants, viewer),
        };

        Ok(ConversationSummary {
            id,
            participants,
            title: row.title.clone(),
            display_title,
            last_message: row.last_message.clone(),
            created_at: parse_timestamp(&row.created_at, "conversation"),
            updated_at: parse_timestamp(&row.updated_at, "conversation"),
            archived: member.archived,
            unread,
        })
    }

    fn participants_of(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self
            .db
            .members_of(conversation_id)?
            .iter()
            .map(|member| parse_uuid(&member.user_id, "member"))
            .collect())
    }

    /// Label for an untitled conversation: the other participant's display
    /// name, or their raw identifier when the directory fails or has no
    /// entry.
    fn peer_label(&self, participants: &[Uuid], viewer: Uuid) -> String {
        let Some(&peer) = participants.iter().find(|&&id| id != viewer) else {
            return viewer.to_string();
        };
        match self.directory.display_name(peer) {
            Ok(Some(name)) => name,
            Ok(None) => peer.to_string(),
            Err(e) => {
                warn!("profile lookup failed for {}: {}", peer, e);
                peer.to_string()
            }
        }
    }
}

fn message_from_row(row: &MessageRow) -> Message {
    Message {
        id: parse_uuid(&row.id, "message"),
        conversation_id: parse_uuid(&row.conversation_id, "message"),
        from: parse_uuid(&row.author_id, "message"),
        to: row
            .recipient_id
            .as_deref()
            .map(|raw| parse_uuid(raw, "message recipient")),
        body: row.body.clone(),
        created_at: parse_timestamp(&row.created_at, "message"),
    }
}

fn parse_uuid(raw: &str, context: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} id '{}': {}", context, raw, e);
        Uuid::default()
    })
}

fn parse_timestamp(raw: &str, context: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt {} timestamp '{}': {}", context, raw, e);
        DateTime::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{NullDirectory, StaticDirectory};
    use jobline_db::StoreError;

    struct FailingDirectory;

    impl ProfileDirectory for FailingDirectory {
        fn display_name(&self, _user_id: Uuid) -> anyhow::Result<Option<String>> {
            anyhow::bail!("profile service unreachable")
        }
    }

    fn service() -> MessagingService {
        service_with(Arc::new(NullDirectory))
    }

    fn service_with(directory: Arc<dyn ProfileDirectory>) -> MessagingService {
        MessagingService::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Dispatcher::new(),
            directory,
        )
    }

    #[test]
    fn send_without_id_starts_and_reuses_the_conversation() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let first = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let second = service.send(None, u1, Some(u2), "again", None).unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);

        let messages = service
            .messages_in(first.conversation_id, u1)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[1].body, "again");

        let listed = service.conversations_for(u1, false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_message.as_deref(), Some("again"));
    }

    #[test]
    fn send_with_unknown_id_is_an_error_not_a_create() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let result = service.send(Some(Uuid::new_v4()), u1, Some(u2), "hello", None);
        assert!(matches!(
            result,
            Err(ServiceError::Store(StoreError::ConversationNotFound(_)))
        ));
        assert!(service.conversations_for(u1, true).unwrap().is_empty());
    }

    #[test]
    fn send_needs_a_recipient_when_no_conversation_is_given() {
        let service = service();
        let result = service.send(None, Uuid::new_v4(), None, "hello", None);
        assert!(matches!(result, Err(ServiceError::MissingRecipient)));
    }

    #[test]
    fn start_or_get_returns_one_conversation_per_pair() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let first = service.start_or_get_conversation(u1, u2, Some("Backend role")).unwrap();
        let second = service.start_or_get_conversation(u2, u1, None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title.as_deref(), Some("Backend role"));
        assert_eq!(first.participants.len(), 2);
    }

    #[test]
    fn archive_hides_for_one_side_only() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let message = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let cid = message.conversation_id;

        let summary = service.archive(cid, u1, true).unwrap();
        assert!(summary.archived);

        assert!(service.conversations_for(u1, false).unwrap().is_empty());
        assert_eq!(service.conversations_for(u1, true).unwrap().len(), 1);
        assert_eq!(service.conversations_for(u2, false).unwrap().len(), 1);

        service.archive(cid, u1, false).unwrap();
        assert_eq!(service.conversations_for(u1, false).unwrap().len(), 1);
    }

    #[test]
    fn non_participants_are_forbidden() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let message = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let cid = message.conversation_id;

        assert!(matches!(
            service.archive(cid, stranger, true),
            Err(ServiceError::Forbidden)
        ));
        assert!(matches!(
            service.delete_for_user(cid, stranger),
            Err(ServiceError::Forbidden)
        ));
        assert!(matches!(
            service.messages_in(cid, stranger),
            Err(ServiceError::Forbidden)
        ));
    }

    #[test]
    fn delete_for_user_is_one_sided_and_preserves_history() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let message = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let cid = message.conversation_id;

        service.delete_for_user(cid, u1).unwrap();

        assert!(service.conversations_for(u1, true).unwrap().is_empty());
        assert_eq!(service.conversations_for(u2, false).unwrap().len(), 1);
        assert_eq!(service.messages_in(cid, u2).unwrap().len(), 1);
    }

    #[test]
    fn mark_read_clears_the_unread_count() {
        let service = service();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let message = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let cid = message.conversation_id;

        assert_eq!(service.summary_for(cid, u2).unwrap().unread, 1);
        assert_eq!(service.summary_for(cid, u1).unwrap().unread, 0);

        let summary = service.mark_read(cid, u2).unwrap();
        assert_eq!(summary.unread, 0);
    }

    #[test]
    fn untitled_conversations_use_the_peer_display_name() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let mut directory = StaticDirectory::new();
        directory.insert(u2, "Dana Recruiter");
        let service = service_with(Arc::new(directory));

        let message = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let summary = service.summary_for(message.conversation_id, u1).unwrap();
        assert_eq!(summary.display_title, "Dana Recruiter");

        // The other side has no directory entry and falls back to the id
        let summary = service.summary_for(message.conversation_id, u2).unwrap();
        assert_eq!(summary.display_title, u1.to_string());
    }

    #[test]
    fn directory_failure_falls_back_to_the_raw_identifier() {
        let service = service_with(Arc::new(FailingDirectory));
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let message = service.send(None, u1, Some(u2), "hello", None).unwrap();
        let summary = service.summary_for(message.conversation_id, u1).unwrap();
        assert_eq!(summary.display_title, u2.to_string());
    }

    #[test]
    fn explicit_titles_win_over_the_directory() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let mut directory = StaticDirectory::new();
        directory.insert(u2, "Dana Recruiter");
        let service = service_with(Arc::new(directory));

        let message = service
            .send(None, u1, Some(u2), "hello", Some("Senior Rust role"))
            .unwrap();
        let summary = service.summary_for(message.conversation_id, u1).unwrap();
        assert_eq!(summary.display_title, "Senior Rust role");
    }

    #[tokio::test]
    async fn send_fans_out_to_every_participant() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let service = MessagingService::new(db, dispatcher.clone(), Arc::new(NullDirectory));

        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let (_c1, mut sender_rx) = dispatcher.register(u1);
        let (_c2, mut recipient_rx) = dispatcher.register(u2);

        let sent = service.send(None, u1, Some(u2), "hello", None).unwrap();

        for rx in [&mut sender_rx, &mut recipient_rx] {
            let event = rx.recv().await.unwrap();
            let GatewayEvent::MessageCreate {
                conversation_id,
                message,
            } = event
            else {
                panic!("expected MessageCreate");
            };
            assert_eq!(conversation_id, sent.conversation_id);
            assert_eq!(message.id, sent.id);
            assert_eq!(message.body, "hello");
        }
    }

    #[tokio::test]
    async fn archive_notifies_only_the_acting_user() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let service = MessagingService::new(db, dispatcher.clone(), Arc::new(NullDirectory));

        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let sent = service.send(None, u1, Some(u2), "hello", None).unwrap();

        let (_c1, mut u1_rx) = dispatcher.register(u1);
        let (_c2, mut u2_rx) = dispatcher.register(u2);

        service.archive(sent.conversation_id, u1, true).unwrap();

        let event = u1_rx.recv().await.unwrap();
        let GatewayEvent::ConversationUpdate { conversation } = event else {
            panic!("expected ConversationUpdate");
        };
        assert!(conversation.archived);
        assert!(u2_rx.try_recv().is_err());
    }
}
