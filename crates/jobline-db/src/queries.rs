use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::Database;
use crate::StoreError;
use crate::models::{ConversationRow, MemberRow, MessageRow};

/// Current time as stored in SQLite: RFC3339 with microseconds, UTC.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Unordered participant set key: sorted ids joined with ':'. The UNIQUE
/// constraint on this column is what makes find-or-create race-safe.
fn pair_key(ids: &[Uuid]) -> String {
    let mut keys: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    keys.sort();
    keys.join(":")
}

impl Database {
    // -- Conversations --

    pub fn create_conversation(
        &self,
        participants: &[Uuid],
        title: Option<&str>,
    ) -> Result<ConversationRow, StoreError> {
        let mut ids = participants.to_vec();
        ids.sort();
        ids.dedup();
        if ids.len() < 2 {
            return Err(StoreError::InvalidParticipants);
        }

        let id = Uuid::new_v4();
        let now = now_timestamp();

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, pair_key, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id.to_string(), pair_key(&ids), title, now],
            )?;
            for user in &ids {
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)",
                    params![id.to_string(), user.to_string()],
                )?;
            }
            tx.commit()?;

            query_conversation(conn, id)?.ok_or(StoreError::ConversationNotFound(id))
        })
    }

    /// Lookup by unordered participant pair.
    pub fn find_conversation(
        &self,
        a: Uuid,
        b: Uuid,
    ) -> Result<Option<ConversationRow>, StoreError> {
        let key = pair_key(&[a, b]);
        self.with_conn(|conn| query_conversation_by_pair_key(conn, &key))
    }

    /// Find-or-create for a participant pair. `INSERT .. ON CONFLICT DO
    /// NOTHING` against the pair_key constraint means concurrent first
    /// contact from both sides resolves to a single row; the loser reads
    /// the winner's record. Returns `(row, created)`.
    pub fn find_or_create_conversation(
        &self,
        a: Uuid,
        b: Uuid,
        title: Option<&str>,
    ) -> Result<(ConversationRow, bool), StoreError> {
        if a == b {
            return Err(StoreError::InvalidParticipants);
        }

        let key = pair_key(&[a, b]);
        let id = Uuid::new_v4();
        let now = now_timestamp();

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT INTO conversations (id, pair_key, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(pair_key) DO NOTHING",
                params![id.to_string(), key, title, now],
            )?;
            if inserted == 1 {
                for user in [a, b] {
                    tx.execute(
                        "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)",
                        params![id.to_string(), user.to_string()],
                    )?;
                }
            }
            tx.commit()?;

            let row = conn.query_row(
                "SELECT id, title, last_message, created_at, updated_at
                 FROM conversations WHERE pair_key = ?1",
                [&key],
                map_conversation_row,
            )?;
            Ok((row, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<ConversationRow, StoreError> {
        self.with_conn(|conn| {
            query_conversation(conn, id)?.ok_or(StoreError::ConversationNotFound(id))
        })
    }

    /// Conversations `user_id` participates in and has not hidden, newest
    /// activity first. Archived entries are filtered unless asked for.
    pub fn list_conversations(
        &self,
        user_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<(ConversationRow, MemberRow)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.title, c.last_message, c.created_at, c.updated_at,
                        m.user_id, m.archived, m.hidden, m.last_read_at
                 FROM conversations c
                 JOIN conversation_members m ON m.conversation_id = c.id
                 WHERE m.user_id = ?1 AND m.hidden = 0 AND (?2 OR m.archived = 0)
                 ORDER BY c.updated_at DESC, c.id ASC",
            )?;

            let rows = stmt
                .query_map(params![user_id.to_string(), include_archived], |row| {
                    let conversation = ConversationRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        last_message: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    };
                    let member = MemberRow {
                        conversation_id: conversation.id.clone(),
                        user_id: row.get(5)?,
                        archived: row.get(6)?,
                        hidden: row.get(7)?,
                        last_read_at: row.get(8)?,
                    };
                    Ok((conversation, member))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Members --

    pub fn members_of(&self, conversation_id: Uuid) -> Result<Vec<MemberRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, archived, hidden, last_read_at
                 FROM conversation_members
                 WHERE conversation_id = ?1
                 ORDER BY user_id",
            )?;

            let rows = stmt
                .query_map([conversation_id.to_string()], map_member_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<MemberRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT conversation_id, user_id, archived, hidden, last_read_at
                     FROM conversation_members
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id.to_string(), user_id.to_string()],
                    map_member_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Idempotent per-user archive flag. Other participants are untouched.
    pub fn set_archived(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        archived: bool,
    ) -> Result<(), StoreError> {
        self.update_member_flag(
            conversation_id,
            user_id,
            "UPDATE conversation_members SET archived = ?3
             WHERE conversation_id = ?1 AND user_id = ?2",
            Some(archived),
        )
    }

    /// Delete-for-user: the conversation disappears from this user's lists
    /// going forward. Messages and the other side's view are untouched.
    pub fn set_hidden(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        self.update_member_flag(
            conversation_id,
            user_id,
            "UPDATE conversation_members SET hidden = 1
             WHERE conversation_id = ?1 AND user_id = ?2",
            None,
        )
    }

    pub fn set_last_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversation_members SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string(), now],
            )?;
            if changed == 0 {
                return Err(missing_member_error(conn, conversation_id, user_id));
            }
            Ok(())
        })
    }

    fn update_member_flag(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        sql: &str,
        flag: Option<bool>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = match flag {
                Some(value) => conn.execute(
                    sql,
                    params![conversation_id.to_string(), user_id.to_string(), value],
                )?,
                None => conn.execute(
                    sql,
                    params![conversation_id.to_string(), user_id.to_string()],
                )?,
            };
            if changed == 0 {
                return Err(missing_member_error(conn, conversation_id, user_id));
            }
            Ok(())
        })
    }

    // -- Messages --

    /// Append a message and bump the conversation's denormalized
    /// `last_message`/`updated_at` in the same transaction. `updated_at`
    /// only moves forward (MAX against the stored value).
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        from: Uuid,
        to: Option<Uuid>,
        body: &str,
    ) -> Result<MessageRow, StoreError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(StoreError::EmptyBody);
        }

        let id = Uuid::new_v4();
        let now = now_timestamp();

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM conversations WHERE id = ?1",
                    [conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }

            let is_member: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM conversation_members
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id.to_string(), from.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if is_member.is_none() {
                return Err(StoreError::NotParticipant {
                    conversation: conversation_id,
                    user: from,
                });
            }

            tx.execute(
                "INSERT INTO messages (id, conversation_id, author_id, recipient_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    conversation_id.to_string(),
                    from.to_string(),
                    to.map(|u| u.to_string()),
                    body,
                    now
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message = ?2, updated_at = MAX(updated_at, ?3)
                 WHERE id = ?1",
                params![conversation_id.to_string(), body, now],
            )?;
            tx.commit()?;

            Ok(MessageRow {
                id: id.to_string(),
                conversation_id: conversation_id.to_string(),
                author_id: from.to_string(),
                recipient_id: to.map(|u| u.to_string()),
                body: body.to_string(),
                created_at: now.clone(),
            })
        })
    }

    /// Full thread, ascending `(created_at, id)`.
    pub fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, author_id, recipient_id, body, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt
                .query_map([conversation_id.to_string()], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        author_id: row.get(2)?,
                        recipient_id: row.get(3)?,
                        body: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Messages authored by someone else after the member's last_read_at.
    /// A member who has never read anything counts every foreign message.
    pub fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 WHERE m.conversation_id = ?1 AND m.author_id <> ?2
                   AND m.created_at > COALESCE(
                       (SELECT last_read_at FROM conversation_members
                        WHERE conversation_id = ?1 AND user_id = ?2), '')",
                params![conversation_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }
}

fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<ConversationRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, title, last_message, created_at, updated_at
             FROM conversations WHERE id = ?1",
            [id.to_string()],
            map_conversation_row,
        )
        .optional()?;
    Ok(row)
}

fn query_conversation_by_pair_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<ConversationRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, title, last_message, created_at, updated_at
             FROM conversations WHERE pair_key = ?1",
            [key],
            map_conversation_row,
        )
        .optional()?;
    Ok(row)
}

fn map_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        title: row.get(1)?,
        last_message: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn map_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        archived: row.get(2)?,
        hidden: row.get(3)?,
        last_read_at: row.get(4)?,
    })
}

fn missing_member_error(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> StoreError {
    let exists = conn
        .query_row(
            "SELECT id FROM conversations WHERE id = ?1",
            [conversation_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional();

    match exists {
        Ok(Some(_)) => StoreError::NotParticipant {
            conversation: conversation_id,
            user: user_id,
        },
        Ok(None) => StoreError::ConversationNotFound(conversation_id),
        Err(e) => StoreError::Storage(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn pair() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn create_requires_two_distinct_participants() {
        let db = db();
        let u = Uuid::new_v4();

        assert!(matches!(
            db.create_conversation(&[u], None),
            Err(StoreError::InvalidParticipants)
        ));
        assert!(matches!(
            db.create_conversation(&[u, u], None),
            Err(StoreError::InvalidParticipants)
        ));
        assert!(matches!(
            db.find_or_create_conversation(u, u, None),
            Err(StoreError::InvalidParticipants)
        ));
    }

    #[test]
    fn create_conversation_supports_more_than_two_participants() {
        let db = db();
        let (a, b) = pair();
        let c = Uuid::new_v4();

        let row = db
            .create_conversation(&[a, b, c], Some("Panel interview"))
            .unwrap();
        let cid: Uuid = row.id.parse().unwrap();

        assert_eq!(db.members_of(cid).unwrap().len(), 3);
        db.append_message(cid, c, None, "welcome").unwrap();
        assert_eq!(db.list_conversations(c, false).unwrap().len(), 1);
    }

    #[test]
    fn find_or_create_is_idempotent_and_unordered() {
        let db = db();
        let (a, b) = pair();

        let (first, created) = db.find_or_create_conversation(a, b, Some("Re: role")).unwrap();
        assert!(created);

        let (second, created) = db.find_or_create_conversation(b, a, None).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let found = db.find_conversation(b, a).unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.title.as_deref(), Some("Re: role"));
    }

    #[test]
    fn concurrent_find_or_create_yields_one_conversation() {
        let db = Arc::new(db());
        let (a, b) = pair();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    // Both sides make first contact simultaneously
                    let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
                    db.find_or_create_conversation(x, y, None).unwrap().0.id
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn append_updates_metadata_and_orders_messages() {
        let db = db();
        let (a, b) = pair();
        let (conversation, _) = db.find_or_create_conversation(a, b, None).unwrap();
        let cid: Uuid = conversation.id.parse().unwrap();

        db.append_message(cid, a, Some(b), "hello").unwrap();
        db.append_message(cid, b, Some(a), "hi back").unwrap();
        db.append_message(cid, a, None, "  still there?  ").unwrap();

        let refreshed = db.get_conversation(cid).unwrap();
        assert_eq!(refreshed.last_message.as_deref(), Some("still there?"));
        assert!(refreshed.updated_at >= refreshed.created_at);

        let messages = db.list_messages(cid).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[2].body, "still there?");
        for window in messages.windows(2) {
            assert!(
                (window[0].created_at.as_str(), window[0].id.as_str())
                    <= (window[1].created_at.as_str(), window[1].id.as_str())
            );
        }
        assert!(refreshed.updated_at.as_str() >= messages[2].created_at.as_str());
    }

    #[test]
    fn append_rejects_bad_input() {
        let db = db();
        let (a, b) = pair();
        let stranger = Uuid::new_v4();
        let (conversation, _) = db.find_or_create_conversation(a, b, None).unwrap();
        let cid: Uuid = conversation.id.parse().unwrap();

        assert!(matches!(
            db.append_message(cid, a, None, "   "),
            Err(StoreError::EmptyBody)
        ));
        assert!(matches!(
            db.append_message(cid, stranger, None, "let me in"),
            Err(StoreError::NotParticipant { .. })
        ));
        assert!(matches!(
            db.append_message(Uuid::new_v4(), a, None, "anyone?"),
            Err(StoreError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn archive_is_per_user() {
        let db = db();
        let (a, b) = pair();
        let (conversation, _) = db.find_or_create_conversation(a, b, None).unwrap();
        let cid: Uuid = conversation.id.parse().unwrap();

        db.set_archived(cid, a, true).unwrap();
        // Idempotent
        db.set_archived(cid, a, true).unwrap();

        assert!(db.list_conversations(a, false).unwrap().is_empty());
        assert_eq!(db.list_conversations(a, true).unwrap().len(), 1);
        assert_eq!(db.list_conversations(b, false).unwrap().len(), 1);

        db.set_archived(cid, a, false).unwrap();
        assert_eq!(db.list_conversations(a, false).unwrap().len(), 1);

        assert!(matches!(
            db.set_archived(cid, Uuid::new_v4(), true),
            Err(StoreError::NotParticipant { .. })
        ));
        assert!(matches!(
            db.set_archived(Uuid::new_v4(), a, true),
            Err(StoreError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn hidden_removes_only_that_users_view() {
        let db = db();
        let (a, b) = pair();
        let (conversation, _) = db.find_or_create_conversation(a, b, None).unwrap();
        let cid: Uuid = conversation.id.parse().unwrap();
        db.append_message(cid, a, Some(b), "ping").unwrap();

        db.set_hidden(cid, a).unwrap();

        assert!(db.list_conversations(a, true).unwrap().is_empty());
        assert_eq!(db.list_conversations(b, false).unwrap().len(), 1);
        // Underlying messages survive
        assert_eq!(db.list_messages(cid).unwrap().len(), 1);
    }

    #[test]
    fn unread_counts_follow_last_read() {
        let db = db();
        let (a, b) = pair();
        let (conversation, _) = db.find_or_create_conversation(a, b, None).unwrap();
        let cid: Uuid = conversation.id.parse().unwrap();

        db.append_message(cid, a, Some(b), "one").unwrap();
        db.append_message(cid, a, Some(b), "two").unwrap();

        // Own messages never count as unread
        assert_eq!(db.unread_count(cid, a).unwrap(), 0);
        assert_eq!(db.unread_count(cid, b).unwrap(), 2);

        db.set_last_read(cid, b).unwrap();
        assert_eq!(db.unread_count(cid, b).unwrap(), 0);

        db.append_message(cid, a, Some(b), "three").unwrap();
        assert_eq!(db.unread_count(cid, b).unwrap(), 1);
    }

    #[test]
    fn conversation_list_is_sorted_by_activity() {
        let db = db();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let (first, _) = db.find_or_create_conversation(a, b, None).unwrap();
        let (second, _) = db.find_or_create_conversation(a, c, None).unwrap();

        let fid: Uuid = first.id.parse().unwrap();
        let sid: Uuid = second.id.parse().unwrap();

        db.append_message(sid, c, Some(a), "newer").unwrap();
        db.append_message(fid, b, Some(a), "newest").unwrap();

        let listed = db.list_conversations(a, false).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.id, first.id);
        assert_eq!(listed[1].0.id, second.id);
    }
}
