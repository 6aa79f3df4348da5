use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            email         TEXT NOT NULL UNIQUE,
            username      TEXT NOT NULL,
            display_name  TEXT,
            avatar_url    TEXT,
            is_online     INTEGER NOT NULL DEFAULT 0,
            last_seen     TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channels (
            id                 TEXT PRIMARY KEY,
            name               TEXT NOT NULL,
            description        TEXT,
            is_private         INTEGER NOT NULL DEFAULT 0,
            is_direct_message  INTEGER NOT NULL DEFAULT 0,
            -- sorted 'a:b' user pair; NULL for non-direct channels
            direct_key         TEXT UNIQUE,
            created_by         TEXT NOT NULL REFERENCES users(id),
            created_at         TEXT NOT NULL
        );

        -- At most one public channel, whoever wins the bootstrap race.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_public
            ON channels(name) WHERE name = 'Public Channel';

        CREATE TABLE IF NOT EXISTS channel_members (
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            role        TEXT NOT NULL,
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (channel_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_channel_members_user
            ON channel_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                 TEXT PRIMARY KEY,
            channel_id         TEXT NOT NULL REFERENCES channels(id),
            user_id            TEXT NOT NULL REFERENCES users(id),
            content            TEXT NOT NULL,
            message_type       TEXT NOT NULL DEFAULT 'text',
            parent_message_id  TEXT REFERENCES messages(id),
            is_edited          INTEGER NOT NULL DEFAULT 0,
            is_deleted         INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
