//! Row mapping between SQLite columns and `staffroom-types` models.
//!
//! Ids are stored as hyphenated UUID text and timestamps as fixed-width
//! RFC 3339 text (microseconds, `Z` suffix) so that lexical order is
//! chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use staffroom_types::models::{Author, Channel, MemberRole, Message, User};

pub const USER_COLUMNS: &str =
    "id, email, username, display_name, avatar_url, is_online, last_seen, created_at, updated_at";

pub const CHANNEL_COLUMNS: &str =
    "id, name, description, is_private, is_direct_message, created_by, created_at";

pub const MESSAGE_COLUMNS: &str = "id, channel_id, user_id, content, message_type, parent_message_id, \
     is_edited, is_deleted, created_at, updated_at";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in the stored timestamp format.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

pub fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn role_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<MemberRole> {
    let raw: String = row.get(idx)?;
    MemberRole::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown member role '{raw}'").into(),
        )
    })
}

/// Reads a user laid out as [`USER_COLUMNS`] starting at column `base`.
pub fn user_at(row: &Row<'_>, base: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, base)?,
        email: row.get(base + 1)?,
        username: row.get(base + 2)?,
        display_name: row.get(base + 3)?,
        avatar_url: row.get(base + 4)?,
        is_online: row.get(base + 5)?,
        last_seen: ts_at(row, base + 6)?,
        created_at: ts_at(row, base + 7)?,
        updated_at: ts_at(row, base + 8)?,
    })
}

pub fn channel_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: uuid_at(row, base)?,
        name: row.get(base + 1)?,
        description: row.get(base + 2)?,
        is_private: row.get(base + 3)?,
        is_direct_message: row.get(base + 4)?,
        created_by: uuid_at(row, base + 5)?,
        created_at: ts_at(row, base + 6)?,
    })
}

pub fn message_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, base)?,
        channel_id: uuid_at(row, base + 1)?,
        user_id: uuid_at(row, base + 2)?,
        content: row.get(base + 3)?,
        message_type: row.get(base + 4)?,
        parent_message_id: opt_uuid_at(row, base + 5)?,
        is_edited: row.get(base + 6)?,
        is_deleted: row.get(base + 7)?,
        created_at: ts_at(row, base + 8)?,
        updated_at: ts_at(row, base + 9)?,
    })
}

/// Reads an optional author (`id, username, display_name, avatar_url`) from
/// a LEFT JOIN; a NULL id means the join found nothing.
pub fn author_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Option<Author>> {
    let Some(id) = opt_uuid_at(row, base)? else {
        return Ok(None);
    };
    Ok(Some(Author {
        id,
        username: row.get(base + 1)?,
        display_name: row.get(base + 2)?,
        avatar_url: row.get(base + 3)?,
    }))
}

/// Order-independent key identifying the direct channel between two users.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_swap_invariant() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(a, b), direct_key(b, a));
        assert_ne!(direct_key(a, b), direct_key(a, a));
    }

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::seconds(1);
        assert!(format_ts(early) < format_ts(late));
        assert_eq!(format_ts(early).len(), format_ts(late).len());
    }

    #[test]
    fn now_ts_round_trips_through_rfc3339() {
        let now = now_ts();
        assert!(now.ends_with('Z'));
        assert_eq!(now.len(), "2026-01-01T00:00:00.000000Z".len());
        assert!(DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
