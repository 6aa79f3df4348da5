use anyhow::Result;
use rusqlite::params;
use tracing::info;
use uuid::Uuid;

use staffroom_types::models::{Channel, MemberRole, PUBLIC_CHANNEL_NAME};

use crate::Database;
use crate::models::{CHANNEL_COLUMNS, channel_at, now_ts, uuid_at};

pub const ADMIN_EMAIL: &str = "admin@staffroom.local";
pub const ADMIN_USERNAME: &str = "admin";

impl Database {
    /// Ensure the admin user and the singleton public channel exist. Every
    /// write is a conflict-tolerant insert, so parallel first runs (even from
    /// separate processes sharing the file) end with exactly one channel.
    pub fn ensure_public_channel(&self) -> Result<Channel> {
        let admin_id = Uuid::new_v4().to_string();
        let channel_id = Uuid::new_v4().to_string();
        let now = now_ts();

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO users (id, email, username, display_name, is_online, last_seen, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'Administrator', 0, ?4, ?4, ?4)
                 ON CONFLICT(email) DO NOTHING",
                params![admin_id, ADMIN_EMAIL, ADMIN_USERNAME, now],
            )?;
            let admin = tx.query_row(
                "SELECT id FROM users WHERE email = ?1",
                [ADMIN_EMAIL],
                |row| uuid_at(row, 0),
            )?;

            let created = tx.execute(
                "INSERT INTO channels (id, name, description, is_private, is_direct_message, created_by, created_at)
                 VALUES (?1, ?2, 'Open to everyone', 0, 0, ?3, ?4)
                 ON CONFLICT DO NOTHING",
                params![channel_id, PUBLIC_CHANNEL_NAME, admin.to_string(), now],
            )?;

            let channel = tx.query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE name = ?1"),
                [PUBLIC_CHANNEL_NAME],
                |row| channel_at(row, 0),
            )?;

            tx.execute(
                "INSERT OR IGNORE INTO channel_members (channel_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    channel.id.to_string(),
                    admin.to_string(),
                    MemberRole::Owner.as_str(),
                    now
                ],
            )?;

            if created > 0 {
                info!("Created public channel {}", channel.id);
            }
            Ok(channel)
        })
    }
}
