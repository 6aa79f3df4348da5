use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use staffroom_types::models::{
    DELETED_MESSAGE_PLACEHOLDER, MESSAGE_TYPE_TEXT, Message, MessageView, ParentPreview, Reaction,
};

use crate::Database;
use crate::models::{MESSAGE_COLUMNS, author_at, message_at, now_ts, ts_at, uuid_at};

impl Database {
    /// Insert a text message. A parent that is unknown, deleted or belongs to
    /// another channel is dropped and the message is stored without one.
    pub fn insert_message(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        content: &str,
        parent_message_id: Option<Uuid>,
    ) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.with_tx(|tx| {
            let parent = match parent_message_id {
                Some(parent_id) => tx
                    .query_row(
                        "SELECT id FROM messages WHERE id = ?1 AND channel_id = ?2 AND is_deleted = 0",
                        [parent_id.to_string(), channel_id.to_string()],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?,
                None => None,
            };

            let message = tx.query_row(
                &format!(
                    "INSERT INTO messages (id, channel_id, user_id, content, message_type, parent_message_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![
                    id,
                    channel_id.to_string(),
                    user_id.to_string(),
                    content,
                    MESSAGE_TYPE_TEXT,
                    parent,
                    now
                ],
                |row| message_at(row, 0),
            )?;
            Ok(message)
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let message = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id.to_string()],
                    |row| message_at(row, 0),
                )
                .optional()?;
            Ok(message)
        })
    }

    /// Non-deleted messages of a channel, oldest first.
    pub fn channel_messages(&self, channel_id: Uuid) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ?1 AND is_deleted = 0
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map([channel_id.to_string()], |row| message_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Author-guarded edit. Returns rows affected; 0 means the message is
    /// missing, deleted, or owned by someone else.
    pub fn edit_message(&self, id: Uuid, user_id: Uuid, content: &str) -> Result<usize> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?3, is_edited = 1, updated_at = ?4
                 WHERE id = ?1 AND user_id = ?2 AND is_deleted = 0",
                params![id.to_string(), user_id.to_string(), content, now],
            )?;
            Ok(n)
        })
    }

    /// Author-guarded soft delete. Repeating it still matches the row, so a
    /// second delete by the author reports 1.
    pub fn soft_delete_message(&self, id: Uuid, user_id: Uuid) -> Result<usize> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET
                     is_deleted = 1,
                     content = ?3,
                     updated_at = CASE WHEN is_deleted = 1 THEN updated_at ELSE ?4 END
                 WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id.to_string(), DELETED_MESSAGE_PLACEHOLDER, now],
            )?;
            Ok(n)
        })
    }

    /// Write a receipt for every message in the channel authored by someone
    /// else that the user has not read yet. Returns the number of new receipts.
    pub fn mark_channel_read(&self, channel_id: Uuid, user_id: Uuid) -> Result<usize> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 SELECT id, ?2, ?3 FROM messages
                 WHERE channel_id = ?1 AND user_id != ?2",
                params![channel_id.to_string(), user_id.to_string(), now],
            )?;
            Ok(n)
        })
    }

    pub fn read_receipt_count(&self, message_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM read_receipts WHERE message_id = ?1",
                [message_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Unread (non-deleted, authored by others, no receipt) per channel the
    /// user belongs to. Channels with nothing unread report 0.
    pub fn unread_counts(&self, user_id: Uuid) -> Result<Vec<(Uuid, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cm.channel_id, COUNT(m.id)
                 FROM channel_members cm
                 LEFT JOIN messages m
                     ON m.channel_id = cm.channel_id
                    AND m.user_id != cm.user_id
                    AND m.is_deleted = 0
                    AND NOT EXISTS (
                        SELECT 1 FROM read_receipts r
                        WHERE r.message_id = m.id AND r.user_id = cm.user_id
                    )
                 WHERE cm.user_id = ?1
                 GROUP BY cm.channel_id",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok((uuid_at(row, 0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Reactions --

    /// Returns whether a new reaction row was written.
    pub fn add_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<bool> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id.to_string(), user_id.to_string(), emoji, now],
            )?;
            Ok(n > 0)
        })
    }

    pub fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id.to_string(), user_id.to_string(), emoji],
            )?;
            Ok(n > 0)
        })
    }

    pub fn reactions_for_message(&self, message_id: Uuid) -> Result<Vec<Reaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id = ?1
                 ORDER BY created_at, rowid",
            )?;
            let rows = stmt
                .query_map([message_id.to_string()], |row| {
                    Ok(Reaction {
                        message_id: uuid_at(row, 0)?,
                        user_id: uuid_at(row, 1)?,
                        emoji: row.get(2)?,
                        created_at: ts_at(row, 3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Feed --

    pub fn count_channel_messages(&self, channel_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1 AND is_deleted = 0",
                [channel_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// One page of a channel, oldest first, with author, parent and parent
    /// author joined in (eliminates N+1 lookups for reply previews).
    pub fn channel_message_views(
        &self,
        channel_id: Uuid,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<MessageView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.channel_id, m.user_id, m.content, m.message_type, m.parent_message_id,
                        m.is_edited, m.is_deleted, m.created_at, m.updated_at,
                        a.id, a.username, a.display_name, a.avatar_url,
                        p.id, p.content, p.is_deleted,
                        pa.id, pa.username, pa.display_name, pa.avatar_url
                 FROM messages m
                 LEFT JOIN users a ON a.id = m.user_id
                 LEFT JOIN messages p ON p.id = m.parent_message_id
                 LEFT JOIN users pa ON pa.id = p.user_id
                 WHERE m.channel_id = ?1 AND m.is_deleted = 0
                 ORDER BY m.created_at ASC, m.rowid ASC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![channel_id.to_string(), limit, offset as i64], |row| {
                    let message = message_at(row, 0)?;
                    let author = author_at(row, 10)?;
                    let parent = match row.get::<_, Option<String>>(14)? {
                        Some(_) => Some(ParentPreview {
                            id: uuid_at(row, 14)?,
                            content: row.get(15)?,
                            is_deleted: row.get(16)?,
                            author: author_at(row, 17)?,
                        }),
                        None => None,
                    };
                    Ok(MessageView { message, author, parent })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
