use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use staffroom_types::models::{Channel, ChannelMember, MemberRole, PUBLIC_CHANNEL_NAME, User};

use crate::Database;
use crate::models::{
    CHANNEL_COLUMNS, USER_COLUMNS, channel_at, direct_key, now_ts, role_at, ts_at, user_at, uuid_at,
};

const DIRECT_CHANNEL_NAME: &str = "Direct Message";

impl Database {
    /// Create a channel owned by `created_by`. Returns `None` if the insert
    /// hit a uniqueness constraint (only possible for the public channel name).
    pub fn create_channel(
        &self,
        name: &str,
        description: Option<&str>,
        is_private: bool,
        created_by: Uuid,
    ) -> Result<Option<Channel>> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.with_tx(|tx| {
            let channel = tx
                .query_row(
                    &format!(
                        "INSERT INTO channels (id, name, description, is_private, is_direct_message, created_by, created_at)
                         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
                         ON CONFLICT DO NOTHING
                         RETURNING {CHANNEL_COLUMNS}"
                    ),
                    params![id, name, description, is_private, created_by.to_string(), now],
                    |row| channel_at(row, 0),
                )
                .optional()?;

            if let Some(channel) = &channel {
                tx.execute(
                    "INSERT OR IGNORE INTO channel_members (channel_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        channel.id.to_string(),
                        created_by.to_string(),
                        MemberRole::Owner.as_str(),
                        now
                    ],
                )?;
            }
            Ok(channel)
        })
    }

    pub fn get_channel(&self, id: Uuid) -> Result<Option<Channel>> {
        self.with_conn(|conn| {
            let channel = conn
                .query_row(
                    &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                    [id.to_string()],
                    |row| channel_at(row, 0),
                )
                .optional()?;
            Ok(channel)
        })
    }

    pub fn public_channel(&self) -> Result<Option<Channel>> {
        self.with_conn(|conn| {
            let channel = conn
                .query_row(
                    &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE name = ?1"),
                    [PUBLIC_CHANNEL_NAME],
                    |row| channel_at(row, 0),
                )
                .optional()?;
            Ok(channel)
        })
    }

    /// Idempotent; returns whether a new membership row was written.
    pub fn add_member(&self, channel_id: Uuid, user_id: Uuid, role: MemberRole) -> Result<bool> {
        let now = now_ts();
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO channel_members (channel_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![channel_id.to_string(), user_id.to_string(), role.as_str(), now],
            )?;
            Ok(n > 0)
        })
    }

    pub fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
                    [channel_id.to_string(), user_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// The membership row for `user_id` in `channel_id`, role included.
    pub fn membership(&self, channel_id: Uuid, user_id: Uuid) -> Result<Option<ChannelMember>> {
        self.with_conn(|conn| {
            let member = conn
                .query_row(
                    "SELECT channel_id, user_id, role, joined_at FROM channel_members
                     WHERE channel_id = ?1 AND user_id = ?2",
                    [channel_id.to_string(), user_id.to_string()],
                    |row| {
                        Ok(ChannelMember {
                            channel_id: uuid_at(row, 0)?,
                            user_id: uuid_at(row, 1)?,
                            role: role_at(row, 2)?,
                            joined_at: ts_at(row, 3)?,
                        })
                    },
                )
                .optional()?;
            Ok(member)
        })
    }

    pub fn user_channels(&self, user_id: Uuid) -> Result<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.description, c.is_private, c.is_direct_message, c.created_by, c.created_at
                 FROM channels c
                 JOIN channel_members cm ON cm.channel_id = c.id
                 WHERE cm.user_id = ?1
                 ORDER BY c.created_at, c.rowid",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| channel_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn channel_members(&self, channel_id: Uuid) -> Result<Vec<User>> {
        let cols = USER_COLUMNS
            .split(", ")
            .map(|c| format!("u.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols}
                 FROM users u
                 JOIN channel_members cm ON cm.user_id = u.id
                 WHERE cm.channel_id = ?1
                 ORDER BY cm.joined_at, cm.rowid"
            ))?;
            let rows = stmt
                .query_map([channel_id.to_string()], |row| user_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Resolve the direct channel for an unordered user pair, creating it
    /// (channel plus both memberships) if needed. The unique `direct_key`
    /// makes concurrent first calls converge on a single row.
    pub fn get_or_create_direct_channel(&self, user1: Uuid, user2: Uuid) -> Result<Uuid> {
        let key = direct_key(user1, user2);
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO channels (id, name, is_private, is_direct_message, direct_key, created_by, created_at)
                 VALUES (?1, ?2, 1, 1, ?3, ?4, ?5)
                 ON CONFLICT(direct_key) DO NOTHING",
                params![id, DIRECT_CHANNEL_NAME, key, user1.to_string(), now],
            )?;

            let channel_id = tx.query_row(
                "SELECT id FROM channels WHERE direct_key = ?1",
                [&key],
                |row| uuid_at(row, 0),
            )?;

            for user in [user1, user2] {
                tx.execute(
                    "INSERT OR IGNORE INTO channel_members (channel_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        channel_id.to_string(),
                        user.to_string(),
                        MemberRole::Member.as_str(),
                        now
                    ],
                )?;
            }
            Ok(channel_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn user(db: &Database, email: &str) -> Uuid {
        db.register_or_login(email, email).unwrap().id
    }

    #[test]
    fn create_channel_adds_owner_membership() {
        let db = Database::open_in_memory().unwrap();
        let owner = user(&db, "o@x.io");
        let channel = db.create_channel("general", None, false, owner).unwrap().unwrap();

        assert!(db.is_member(channel.id, owner).unwrap());
        assert!(!db.is_member(channel.id, Uuid::new_v4()).unwrap());
        assert_eq!(db.user_channels(owner).unwrap(), vec![channel.clone()]);

        let members = db.channel_members(channel.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, owner);

        let membership = db.membership(channel.id, owner).unwrap().unwrap();
        assert_eq!(membership.role, MemberRole::Owner);
        assert_eq!(membership.user_id, owner);
        assert!(db.membership(channel.id, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn add_member_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let owner = user(&db, "o@x.io");
        let other = user(&db, "m@x.io");
        let channel = db.create_channel("general", None, false, owner).unwrap().unwrap();

        assert!(db.add_member(channel.id, other, MemberRole::Member).unwrap());
        assert!(!db.add_member(channel.id, other, MemberRole::Member).unwrap());
        assert_eq!(db.channel_members(channel.id).unwrap().len(), 2);
    }

    #[test]
    fn direct_channel_is_shared_by_both_orderings() {
        let db = Database::open_in_memory().unwrap();
        let a = user(&db, "a@x.io");
        let b = user(&db, "b@x.io");

        let first = db.get_or_create_direct_channel(a, b).unwrap();
        let second = db.get_or_create_direct_channel(b, a).unwrap();
        assert_eq!(first, second);

        let channel = db.get_channel(first).unwrap().unwrap();
        assert!(channel.is_direct_message);
        assert!(channel.is_private);

        let mut members: Vec<Uuid> = db.channel_members(first).unwrap().iter().map(|u| u.id).collect();
        members.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[test]
    fn concurrent_direct_channel_creation_converges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dm.db");
        let setup = Database::open(&path).unwrap();
        let a = user(&setup, "a@x.io");
        let b = user(&setup, "b@x.io");

        // Two independent connections to the same file race on the insert.
        let left = Arc::new(Database::open(&path).unwrap());
        let right = Arc::new(Database::open(&path).unwrap());
        let h1 = std::thread::spawn(move || left.get_or_create_direct_channel(a, b).unwrap());
        let h2 = std::thread::spawn(move || right.get_or_create_direct_channel(b, a).unwrap());
        let (id1, id2) = (h1.join().unwrap(), h2.join().unwrap());

        assert_eq!(id1, id2);
        let count: i64 = setup
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM channels WHERE is_direct_message = 1",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
