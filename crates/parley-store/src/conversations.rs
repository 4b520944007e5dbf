//! CRUD operations for [`Conversation`] records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{ConversationKey, ConversationKind, UserId};

use crate::database::Database;
use crate::error::{conversion_failure, not_found, Result, StoreError};
use crate::models::{ChangeSet, Conversation};
use crate::time::{from_nanos, to_nanos};

const SELECT_CONVERSATION: &str =
    "SELECT c.key, c.kind, c.title, c.avatar_ref, c.last_message_preview, c.last_message_at, c.pending
     FROM conversations c";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a new conversation together with its participants.
    pub fn insert_conversation(&mut self, conversation: &Conversation) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        insert_conversation(&tx, conversation)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert or overwrite a conversation and replace its participant set.
    pub fn upsert_conversation(&mut self, conversation: &Conversation) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        upsert_conversation(&tx, conversation)?;
        tx.commit()?;
        Ok(())
    }

    /// Refresh the denormalised last-message summary. Returns `true` if the
    /// conversation exists locally.
    pub fn update_conversation_summary(
        &self,
        key: &ConversationKey,
        preview: Option<&str>,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let at = at.as_ref().map(to_nanos).transpose()?;
        let affected = self.conn().execute(
            "UPDATE conversations SET last_message_preview = ?1, last_message_at = ?2
             WHERE key = ?3",
            params![preview, at, key.as_str()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by key.
    pub fn conversation_by_key(&self, key: &ConversationKey) -> Result<Conversation> {
        self.find_conversation(key)?.ok_or(StoreError::NotFound)
    }

    /// Fetch a single conversation by key, `None` if it is not cached.
    pub fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("{SELECT_CONVERSATION} WHERE c.key = ?1"),
                params![key.as_str()],
                row_to_conversation,
            )
            .optional()?;

        match row {
            Some(mut conversation) => {
                conversation.participant_ids = participants_of(self.conn(), key)?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    /// Conversations `user` participates in, most recently active first.
    /// Conversations without messages sort last.
    pub fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_CONVERSATION}
             JOIN conversation_participants p ON p.conversation_key = c.key
             WHERE p.user_id = ?1
             ORDER BY c.last_message_at IS NULL, c.last_message_at DESC, c.key ASC"
        ))?;

        let rows = stmt.query_map(params![user.as_str()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            let mut conversation = row?;
            conversation.participant_ids = participants_of(self.conn(), &conversation.key)?;
            conversations.push(conversation);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a conversation and every message it owns.  Returns `true` if
    /// the conversation existed.
    pub fn delete_conversation(&mut self, key: &ConversationKey) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let deleted = delete_conversation(&tx, key)?;
        tx.commit()?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Batch
    // ------------------------------------------------------------------

    /// Apply a change set in one transaction. Promotions are treated like
    /// updates: a conversation keeps its key across confirmation.
    pub fn apply_conversation_changes(&mut self, changes: &ChangeSet<Conversation>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn_mut().transaction()?;

        for conversation in &changes.deletions {
            delete_conversation(&tx, &conversation.key)?;
        }
        for conversation in changes.promotions.iter().chain(&changes.updates) {
            if !update_conversation(&tx, conversation)? {
                return Err(StoreError::NotFound);
            }
        }
        for conversation in &changes.inserts {
            insert_conversation(&tx, conversation)?;
        }

        tx.commit()?;

        tracing::debug!(
            inserted = changes.inserts.len(),
            updated = changes.updates.len() + changes.promotions.len(),
            deleted = changes.deletions.len(),
            "applied conversation changes"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate(conversation: &Conversation) -> Result<()> {
    if conversation.participant_ids.is_empty() {
        return Err(StoreError::InvalidRecord(format!(
            "conversation {} has no participants",
            conversation.key
        )));
    }
    Ok(())
}

fn insert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    validate(conversation)?;
    conn.execute(
        "INSERT INTO conversations (key, kind, title, avatar_ref, last_message_preview,
                                    last_message_at, pending)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conversation.key.as_str(),
            conversation.kind.as_str(),
            conversation.title,
            conversation.avatar_ref,
            conversation.last_message_preview,
            conversation.last_message_at.as_ref().map(to_nanos).transpose()?,
            conversation.pending,
        ],
    )?;
    write_participants(conn, conversation)
}

fn update_conversation(conn: &Connection, conversation: &Conversation) -> Result<bool> {
    validate(conversation)?;
    let affected = conn.execute(
        "UPDATE conversations
         SET kind = ?1, title = ?2, avatar_ref = ?3, last_message_preview = ?4,
             last_message_at = ?5, pending = ?6
         WHERE key = ?7",
        params![
            conversation.kind.as_str(),
            conversation.title,
            conversation.avatar_ref,
            conversation.last_message_preview,
            conversation.last_message_at.as_ref().map(to_nanos).transpose()?,
            conversation.pending,
            conversation.key.as_str(),
        ],
    )?;
    if affected == 0 {
        return Ok(false);
    }
    write_participants(conn, conversation)?;
    Ok(true)
}

fn upsert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    if !update_conversation(conn, conversation)? {
        insert_conversation(conn, conversation)?;
    }
    Ok(())
}

fn delete_conversation(conn: &Connection, key: &ConversationKey) -> Result<bool> {
    conn.execute(
        "DELETE FROM messages WHERE conversation_key = ?1",
        params![key.as_str()],
    )?;
    // Participants go with the conversation (ON DELETE CASCADE).
    let affected = conn.execute(
        "DELETE FROM conversations WHERE key = ?1",
        params![key.as_str()],
    )?;
    Ok(affected > 0)
}

/// Replace the participant rows of a conversation.
fn write_participants(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        "DELETE FROM conversation_participants WHERE conversation_key = ?1",
        params![conversation.key.as_str()],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO conversation_participants (conversation_key, user_id) VALUES (?1, ?2)",
    )?;
    for user in &conversation.participant_ids {
        stmt.execute(params![conversation.key.as_str(), user.as_str()])?;
    }
    Ok(())
}

fn participants_of(conn: &Connection, key: &ConversationKey) -> Result<BTreeSet<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_key = ?1",
    )?;
    let rows = stmt.query_map(params![key.as_str()], |row| row.get::<_, String>(0))?;

    let mut participants = BTreeSet::new();
    for row in rows {
        participants.insert(UserId(row.map_err(not_found)?));
    }
    Ok(participants)
}

/// Map a `rusqlite::Row` to a [`Conversation`] with an empty participant set;
/// participants live in their own table and are filled in by the caller.
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let key: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let title: Option<String> = row.get(2)?;
    let avatar_ref: Option<String> = row.get(3)?;
    let last_message_preview: Option<String> = row.get(4)?;
    let last_message_at: Option<i64> = row.get(5)?;
    let pending: bool = row.get(6)?;

    let kind: ConversationKind = kind_str.parse().map_err(|e| conversion_failure(1, e))?;

    Ok(Conversation {
        key: ConversationKey(key),
        kind,
        participant_ids: BTreeSet::new(),
        title,
        avatar_ref,
        last_message_preview,
        last_message_at: last_message_at.map(from_nanos),
        pending,
    })
}
