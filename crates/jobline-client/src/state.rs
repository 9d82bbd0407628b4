use uuid::Uuid;

use jobline_types::api::ConversationSummary;
use jobline_types::events::GatewayEvent;
use jobline_types::models::Message;

/// Local mirror of the thread the user currently has open.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
}

/// Client-side mirror of the conversation list and the open thread.
///
/// Push events and poll snapshots are symmetric inputs: every mutation
/// funnels through id-deduplicated, order-restoring merges, so the same
/// update arriving through both paths changes nothing the second time,
/// and nothing depends on which path an update arrived through.
#[derive(Debug)]
pub struct ClientState {
    user_id: Uuid,
    conversations: Vec<ConversationSummary>,
    active: Option<ThreadView>,
}

impl ClientState {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            conversations: Vec::new(),
            active: None,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Conversation list, newest activity first.
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn active_thread(&self) -> Option<&ThreadView> {
        self.active.as_ref()
    }

    /// Open a thread: its messages arrive via the next snapshot merge, and
    /// its unread badge clears locally right away.
    pub fn open_thread(&mut self, conversation_id: Uuid) {
        self.active = Some(ThreadView {
            conversation_id,
            messages: Vec::new(),
        });
        if let Some(entry) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            entry.unread = 0;
        }
    }

    pub fn close_thread(&mut self) {
        self.active = None;
    }

    // -- Push merge --

    pub fn apply_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Ready { .. } => {}
            GatewayEvent::MessageCreate {
                conversation_id,
                message,
            } => self.merge_message(conversation_id, message),
            GatewayEvent::ConversationUpdate { conversation } => self.upsert_summary(conversation),
        }
    }

    fn merge_message(&mut self, conversation_id: Uuid, message: Message) {
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|thread| thread.conversation_id == conversation_id);

        if let Some(thread) = self
            .active
            .as_mut()
            .filter(|thread| thread.conversation_id == conversation_id)
        {
            insert_message(&mut thread.messages, message.clone());
        }

        let own = message.from == self.user_id;
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            Some(entry) => {
                entry.last_message = Some(message.body.clone());
                if message.created_at > entry.updated_at {
                    entry.updated_at = message.created_at;
                }
                if !is_active && !own {
                    entry.unread += 1;
                }
            }
            None => {
                // First contact mid-session: the event does not carry the
                // full record, so synthesize a provisional entry and let
                // the next poll correct it.
                let mut participants = vec![message.from];
                if let Some(to) = message.to {
                    if !participants.contains(&to) {
                        participants.push(to);
                    }
                }
                let peer = participants.iter().copied().find(|&id| id != self.user_id);
                self.conversations.push(ConversationSummary {
                    id: conversation_id,
                    participants,
                    title: None,
                    display_title: peer
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| conversation_id.to_string()),
                    last_message: Some(message.body.clone()),
                    created_at: message.created_at,
                    updated_at: message.created_at,
                    archived: false,
                    unread: u32::from(!is_active && !own),
                });
            }
        }

        self.sort_conversations();
    }

    fn upsert_summary(&mut self, incoming: ConversationSummary) {
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == incoming.id)
        {
            // A stale event must never roll the entry backwards
            Some(existing) if incoming.updated_at >= existing.updated_at => *existing = incoming,
            Some(_) => {}
            None => self.conversations.push(incoming),
        }
        self.clear_active_badge();
        self.sort_conversations();
    }

    // -- Poll merge --

    /// Merge a fetched conversation list. The fetch is corrective, never
    /// destructive: entries only disappear when the snapshot is complete
    /// for this scope, and even then a local entry that is strictly newer
    /// than everything fetched survives (a push may have outrun the poll).
    pub fn apply_conversation_snapshot(
        &mut self,
        snapshot: Vec<ConversationSummary>,
        complete: bool,
    ) {
        let newest_fetched = snapshot.iter().map(|c| c.updated_at).max();
        let fetched_ids: Vec<Uuid> = snapshot.iter().map(|c| c.id).collect();

        for row in snapshot {
            self.upsert_summary(row);
        }

        if complete {
            self.conversations.retain(|c| {
                fetched_ids.contains(&c.id)
                    || newest_fetched.is_none_or(|newest| c.updated_at > newest)
            });
        }

        self.clear_active_badge();
        self.sort_conversations();
    }

    /// Merge a fetched message list for one thread. Ignored unless that
    /// thread is the open one.
    pub fn apply_thread_snapshot(
        &mut self,
        conversation_id: Uuid,
        snapshot: Vec<Message>,
        complete: bool,
    ) {
        let Some(thread) = self
            .active
            .as_mut()
            .filter(|thread| thread.conversation_id == conversation_id)
        else {
            return;
        };

        if complete {
            let newest_fetched = snapshot.iter().map(Message::sort_key).max();
            thread.messages.retain(|m| {
                snapshot.iter().any(|f| f.id == m.id)
                    || newest_fetched.is_none_or(|newest| m.sort_key() > newest)
            });
        }

        for message in snapshot {
            insert_message(&mut thread.messages, message);
        }
    }

    /// The open thread never shows its own unread badge.
    fn clear_active_badge(&mut self) {
        if let Some(active_id) = self.active.as_ref().map(|t| t.conversation_id) {
            if let Some(entry) = self.conversations.iter_mut().find(|c| c.id == active_id) {
                entry.unread = 0;
            }
        }
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
    }
}

/// Insert by id-dedup, keeping ascending `(created_at, id)` order.
fn insert_message(messages: &mut Vec<Message>, message: Message) {
    if messages.iter().any(|m| m.id == message.id) {
        return;
    }
    messages.push(message);
    messages.sort_by_key(Message::sort_key);
}
