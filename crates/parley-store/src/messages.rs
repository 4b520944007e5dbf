//! CRUD operations for [`Message`] records.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{ContentType, ConversationKey, DeliveryStatus, LocalKey, RemoteKey, UserId};

use crate::database::Database;
use crate::error::{conversion_failure, not_found, Result, StoreError};
use crate::models::{ChangeSet, Message, MessageIdentity};
use crate::time::{from_nanos, to_nanos};

const SELECT_MESSAGE: &str = "SELECT remote_key, local_key, conversation_key, sender_id, content,
        content_type, media_ref, timestamp, delivery_status, read_by
     FROM messages";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        insert_message(self.conn(), message)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// All messages of a conversation, oldest first. Messages sharing a
    /// timestamp keep their insertion order.
    pub fn messages_for_conversation(&self, conversation: &ConversationKey) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE conversation_key = ?1
             ORDER BY timestamp ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![conversation.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Messages of a conversation that have not been confirmed yet.
    pub fn pending_messages(&self, conversation: &ConversationKey) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE conversation_key = ?1 AND remote_key IS NULL
             ORDER BY timestamp ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![conversation.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Newest message of a conversation, if any.
    pub fn latest_message(&self, conversation: &ConversationKey) -> Result<Option<Message>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "{SELECT_MESSAGE}
                     WHERE conversation_key = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1"
                ),
                params![conversation.as_str()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn message_by_remote_key(
        &self,
        conversation: &ConversationKey,
        remote_key: &RemoteKey,
    ) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE conversation_key = ?1 AND remote_key = ?2"),
                params![conversation.as_str(), remote_key.as_str()],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn message_by_local_key(
        &self,
        conversation: &ConversationKey,
        local_key: LocalKey,
    ) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE conversation_key = ?1 AND local_key = ?2"),
                params![conversation.as_str(), local_key.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Rewrite a message in place, addressed by its current identity (remote
    /// key once confirmed, local key while pending). Returns `true` if a row
    /// was updated.
    pub fn update_message(&self, message: &Message) -> Result<bool> {
        update_message(self.conn(), message)
    }

    /// Attach the remote identity of `message` to the pending row carrying
    /// the same local key. Returns `true` if a pending row was promoted.
    pub fn promote_message(&self, message: &Message) -> Result<bool> {
        promote_message(self.conn(), message)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a message by its current identity.  Returns `true` if a row was
    /// deleted.
    pub fn delete_message(&self, message: &Message) -> Result<bool> {
        delete_message(self.conn(), message)
    }

    // ------------------------------------------------------------------
    // Batch
    // ------------------------------------------------------------------

    /// Apply a change set in one transaction. Either every write lands or
    /// none does.
    pub fn apply_message_changes(&mut self, changes: &ChangeSet<Message>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn_mut().transaction()?;

        for message in &changes.deletions {
            delete_message(&tx, message)?;
        }
        for message in &changes.promotions {
            if !promote_message(&tx, message)? {
                return Err(StoreError::NotFound);
            }
        }
        for message in &changes.updates {
            if !update_message(&tx, message)? {
                return Err(StoreError::NotFound);
            }
        }
        for message in &changes.inserts {
            insert_message(&tx, message)?;
        }

        tx.commit()?;

        tracing::debug!(
            inserted = changes.inserts.len(),
            updated = changes.updates.len(),
            promoted = changes.promotions.len(),
            deleted = changes.deletions.len(),
            "applied message changes"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (remote_key, local_key, conversation_key, sender_id, content,
                               content_type, media_ref, timestamp, delivery_status, read_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            message.remote_key().map(RemoteKey::as_str),
            message.local_key().map(|k| k.to_string()),
            message.conversation_key.as_str(),
            message.sender_id.as_str(),
            message.content,
            message.content_type.as_str(),
            message.media_ref,
            to_nanos(&message.timestamp)?,
            message.delivery_status.as_str(),
            serde_json::to_string(&message.read_by)?,
        ],
    )?;
    Ok(())
}

fn update_message(conn: &Connection, message: &Message) -> Result<bool> {
    let (column, value) = match &message.identity {
        MessageIdentity::Confirmed { remote_key, .. } => ("remote_key", remote_key.to_string()),
        MessageIdentity::Pending { local_key } => ("local_key", local_key.to_string()),
    };
    write_fields(conn, message, column, &value)
}

fn promote_message(conn: &Connection, message: &Message) -> Result<bool> {
    let local_key = match &message.identity {
        MessageIdentity::Confirmed {
            local_key: Some(local_key),
            ..
        } => *local_key,
        _ => {
            return Err(StoreError::InvalidRecord(
                "promotion requires a confirmed message with a local key".into(),
            ))
        }
    };
    write_fields(conn, message, "local_key", &local_key.to_string())
}

/// Overwrite every mutable column of the row whose `column` equals `value`.
fn write_fields(conn: &Connection, message: &Message, column: &str, value: &str) -> Result<bool> {
    let affected = conn.execute(
        &format!(
            "UPDATE messages
             SET remote_key = ?1, local_key = ?2, sender_id = ?3, content = ?4,
                 content_type = ?5, media_ref = ?6, timestamp = ?7,
                 delivery_status = ?8, read_by = ?9
             WHERE conversation_key = ?10 AND {column} = ?11"
        ),
        params![
            message.remote_key().map(RemoteKey::as_str),
            message.local_key().map(|k| k.to_string()),
            message.sender_id.as_str(),
            message.content,
            message.content_type.as_str(),
            message.media_ref,
            to_nanos(&message.timestamp)?,
            message.delivery_status.as_str(),
            serde_json::to_string(&message.read_by)?,
            message.conversation_key.as_str(),
            value,
        ],
    )?;
    Ok(affected > 0)
}

fn delete_message(conn: &Connection, message: &Message) -> Result<bool> {
    let affected = match &message.identity {
        MessageIdentity::Confirmed { remote_key, .. } => conn.execute(
            "DELETE FROM messages WHERE conversation_key = ?1 AND remote_key = ?2",
            params![message.conversation_key.as_str(), remote_key.as_str()],
        )?,
        MessageIdentity::Pending { local_key } => conn.execute(
            "DELETE FROM messages WHERE conversation_key = ?1 AND local_key = ?2",
            params![message.conversation_key.as_str(), local_key.to_string()],
        )?,
    };
    Ok(affected > 0)
}

/// Map a `rusqlite::Row` (in `SELECT_MESSAGE` column order) to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let remote_key: Option<String> = row.get(0)?;
    let local_key_str: Option<String> = row.get(1)?;
    let conversation_key: String = row.get(2)?;
    let sender_id: String = row.get(3)?;
    let content: String = row.get(4)?;
    let content_type_str: String = row.get(5)?;
    let media_ref: Option<String> = row.get(6)?;
    let timestamp: i64 = row.get(7)?;
    let status_str: String = row.get(8)?;
    let read_by_json: String = row.get(9)?;

    let local_key = local_key_str
        .map(|s| s.parse::<LocalKey>())
        .transpose()
        .map_err(|e| conversion_failure(1, e))?;

    let identity = match (remote_key, local_key) {
        (Some(remote_key), local_key) => MessageIdentity::Confirmed {
            remote_key: RemoteKey(remote_key),
            local_key,
        },
        (None, Some(local_key)) => MessageIdentity::Pending { local_key },
        (None, None) => {
            return Err(conversion_failure(
                0,
                StoreError::InvalidRecord("message without identity".into()),
            ))
        }
    };

    let content_type: ContentType = content_type_str
        .parse()
        .map_err(|e| conversion_failure(5, e))?;
    let delivery_status: DeliveryStatus =
        status_str.parse().map_err(|e| conversion_failure(8, e))?;
    let read_by: BTreeSet<UserId> =
        serde_json::from_str(&read_by_json).map_err(|e| conversion_failure(9, e))?;

    Ok(Message {
        identity,
        conversation_key: ConversationKey(conversation_key),
        sender_id: UserId(sender_id),
        content,
        content_type,
        media_ref,
        timestamp: from_nanos(timestamp),
        delivery_status,
        read_by,
    })
}
