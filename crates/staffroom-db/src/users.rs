use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use staffroom_types::models::{MemberRole, PUBLIC_CHANNEL_NAME, User};

use crate::Database;
use crate::models::{USER_COLUMNS, now_ts, user_at};

pub struct NewUser<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub display_name: Option<&'a str>,
    pub avatar_url: Option<&'a str>,
}

impl Database {
    /// Insert a user. Returns `None` when the email is already taken.
    pub fn create_user(&self, user: &NewUser<'_>) -> Result<Option<User>> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "INSERT INTO users (id, email, username, display_name, avatar_url, is_online, last_seen, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?6)
                         ON CONFLICT(email) DO NOTHING
                         RETURNING {USER_COLUMNS}"
                    ),
                    params![id, user.email, user.username, user.display_name, user.avatar_url, now],
                    |row| user_at(row, 0),
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    [id.to_string()],
                    |row| user_at(row, 0),
                )
                .optional()?;
            Ok(user)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                    [email],
                    |row| user_at(row, 0),
                )
                .optional()?;
            Ok(user)
        })
    }

    /// Patch profile fields; `None` leaves a field untouched.
    pub fn update_user(
        &self,
        id: Uuid,
        username: Option<&str>,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Option<User>> {
        let now = now_ts();
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    &format!(
                        "UPDATE users SET
                             username = COALESCE(?2, username),
                             display_name = COALESCE(?3, display_name),
                             avatar_url = COALESCE(?4, avatar_url),
                             updated_at = ?5
                         WHERE id = ?1
                         RETURNING {USER_COLUMNS}"
                    ),
                    params![id.to_string(), username, display_name, avatar_url, now],
                    |row| user_at(row, 0),
                )
                .optional()?;
            Ok(user)
        })
    }

    /// Upsert keyed on email: an existing user is marked online, a new one is
    /// created online. Either way the user is joined to the public channel if
    /// it exists.
    pub fn register_or_login(&self, email: &str, username: &str) -> Result<User> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.with_tx(|tx| {
            let user = tx.query_row(
                &format!(
                    "INSERT INTO users (id, email, username, is_online, last_seen, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4, ?4, ?4)
                     ON CONFLICT(email) DO UPDATE SET
                         is_online = 1,
                         last_seen = excluded.last_seen,
                         updated_at = excluded.updated_at
                     RETURNING {USER_COLUMNS}"
                ),
                params![id, email, username, now],
                |row| user_at(row, 0),
            )?;

            tx.execute(
                "INSERT OR IGNORE INTO channel_members (channel_id, user_id, role, joined_at)
                 SELECT id, ?1, ?2, ?3 FROM channels WHERE name = ?4",
                params![
                    user.id.to_string(),
                    MemberRole::Member.as_str(),
                    now,
                    PUBLIC_CHANNEL_NAME
                ],
            )?;

            Ok(user)
        })
    }

    /// Returns the number of users updated (0 when the id is unknown).
    pub fn set_presence(&self, id: Uuid, is_online: bool) -> Result<usize> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET is_online = ?2, last_seen = ?3, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), is_online, now],
            )?;
            Ok(n)
        })
    }

    /// Mark every online user offline. Returns how many rows changed.
    pub fn reset_presence(&self) -> Result<usize> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET is_online = 0, last_seen = ?1, updated_at = ?1 WHERE is_online = 1",
                [now],
            )?;
            Ok(n)
        })
    }

    pub fn online_users(&self, excluding: Uuid) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE is_online = 1 AND id != ?1
                 ORDER BY username, id"
            ))?;
            let rows = stmt
                .query_map([excluding.to_string()], |row| user_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Case-insensitive substring search over username, display name and email.
    pub fn search_users(&self, query: &str, excluding: Uuid, limit: u32) -> Result<Vec<User>> {
        let pattern = format!("%{}%", escape_like(query));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE id != ?1
                   AND (username LIKE ?2 ESCAPE '\\'
                        OR display_name LIKE ?2 ESCAPE '\\'
                        OR email LIKE ?2 ESCAPE '\\')
                 ORDER BY username, id
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![excluding.to_string(), pattern, limit], |row| {
                    user_at(row, 0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
