use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use staffroom_db::Database;
use staffroom_db::users::NewUser;
use staffroom_types::models::{Channel, ChannelMember, MemberRole, Message, PublicChannelPage, User};

use crate::error::{ChatError, ChatResult, StorageContext};

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_PAGE_LIMIT: u32 = 100;
const SEARCH_LIMIT: u32 = 50;

/// Profile fields accepted when creating a user directly.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub email: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Domain rules for channels, messages, reactions, receipts and presence.
///
/// Membership and ownership are checked before any write; a failed check
/// returns early and nothing is persisted. Methods block on SQLite, so async
/// callers should run them on the blocking pool.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
}

impl ChatService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create the admin user and public channel if this is the first run.
    pub fn bootstrap(&self) -> ChatResult<Channel> {
        self.db.ensure_public_channel().during("bootstrap")
    }

    // -- Users --

    pub fn get_user(&self, id: Uuid) -> ChatResult<User> {
        self.db
            .get_user_by_id(id)
            .during("get_user")?
            .ok_or(ChatError::NotFound("user"))
    }

    pub fn get_user_by_email(&self, email: &str) -> ChatResult<User> {
        self.db
            .get_user_by_email(email)
            .during("get_user_by_email")?
            .ok_or(ChatError::NotFound("user"))
    }

    pub fn create_user(&self, profile: &UserProfile) -> ChatResult<User> {
        let email = required(&profile.email, "email")?;
        let username = required(&profile.username, "username")?;
        self.db
            .create_user(&NewUser {
                email,
                username,
                display_name: profile.display_name.as_deref(),
                avatar_url: profile.avatar_url.as_deref(),
            })
            .during("create_user")?
            .ok_or_else(|| ChatError::InvalidInput(format!("email {email} is already registered")))
    }

    pub fn update_user(&self, id: Uuid, patch: &ProfilePatch) -> ChatResult<User> {
        if let Some(username) = &patch.username {
            required(username, "username")?;
        }
        self.db
            .update_user(
                id,
                patch.username.as_deref().map(str::trim),
                patch.display_name.as_deref(),
                patch.avatar_url.as_deref(),
            )
            .during("update_user")?
            .ok_or(ChatError::NotFound("user"))
    }

    /// Sole entry point for chat identities: find by email and mark online,
    /// or create the user online.
    pub fn register_or_login(&self, username: &str, email: &str) -> ChatResult<User> {
        let email = required(email, "email")?;
        let username = required(username, "username")?;
        let user = self
            .db
            .register_or_login(email, username)
            .during("register_or_login")?;
        info!("{} ({}) logged in", user.username, user.id);
        Ok(user)
    }

    pub fn update_user_presence(&self, user_id: Uuid, is_online: bool) -> ChatResult<()> {
        let updated = self
            .db
            .set_presence(user_id, is_online)
            .during("update_user_presence")?;
        if updated == 0 {
            return Err(ChatError::NotFound("user"));
        }
        debug!("{} presence -> {}", user_id, if is_online { "online" } else { "offline" });
        Ok(())
    }

    /// Mark every user offline, used when the server stops and no session
    /// is left to report its own disconnect.
    pub fn reset_presence(&self) -> ChatResult<usize> {
        let reset = self.db.reset_presence().during("reset_presence")?;
        info!("reset presence for {} users", reset);
        Ok(reset)
    }

    pub fn get_online_users(&self, excluding: Uuid) -> ChatResult<Vec<User>> {
        self.db.online_users(excluding).during("get_online_users")
    }

    pub fn search_users(&self, query: &str, excluding: Uuid) -> ChatResult<Vec<User>> {
        let query = required(query, "query")?;
        self.db
            .search_users(query, excluding, SEARCH_LIMIT)
            .during("search_users")
    }

    // -- Channels --

    pub fn is_channel_member(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        self.db
            .is_member(channel_id, user_id)
            .during("is_channel_member")
    }

    pub fn get_user_channels(&self, user_id: Uuid) -> ChatResult<Vec<Channel>> {
        self.db.user_channels(user_id).during("get_user_channels")
    }

    pub fn get_channel_members(&self, channel_id: Uuid) -> ChatResult<Vec<User>> {
        self.require_channel(channel_id)?;
        self.db
            .channel_members(channel_id)
            .during("get_channel_members")
    }

    pub fn create_channel(
        &self,
        creator: Uuid,
        name: &str,
        description: Option<&str>,
        is_private: bool,
    ) -> ChatResult<Channel> {
        let name = required(name, "channel name")?;
        self.get_user(creator)?;
        let channel = self
            .db
            .create_channel(name, description, is_private, creator)
            .during("create_channel")?
            .ok_or_else(|| ChatError::InvalidInput(format!("channel name '{name}' is reserved")))?;
        info!("{} created channel {} ({})", creator, channel.name, channel.id);
        Ok(channel)
    }

    /// Join an open channel. Private and direct channels cannot be joined.
    /// Joining again keeps the existing membership, role included.
    pub fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<ChannelMember> {
        let channel = self.require_channel(channel_id)?;
        self.get_user(user_id)?;
        if channel.is_private || channel.is_direct_message {
            return Err(ChatError::AccessDenied);
        }
        self.db
            .add_member(channel_id, user_id, MemberRole::Member)
            .during("join_channel")?;
        self.db
            .membership(channel_id, user_id)
            .during("join_channel")?
            .ok_or(ChatError::NotFound("membership"))
    }

    /// Resolve the direct channel for an unordered pair of users, creating
    /// it on first use.
    pub fn get_or_create_direct_message_channel(&self, user1: Uuid, user2: Uuid) -> ChatResult<Uuid> {
        if user1 == user2 {
            return Err(ChatError::InvalidInput(
                "cannot open a direct channel with yourself".into(),
            ));
        }
        self.get_user(user1)?;
        self.get_user(user2)?;
        self.db
            .get_or_create_direct_channel(user1, user2)
            .during("get_or_create_direct_message_channel")
    }

    // -- Messages --

    /// Non-deleted messages, oldest first. Non-members are denied rather
    /// than handed an empty list.
    pub fn get_channel_messages(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<Vec<Message>> {
        self.require_member(channel_id, user_id)?;
        self.db
            .channel_messages(channel_id)
            .during("get_channel_messages")
    }

    /// Post a message. An unusable `parent_message_id` is silently dropped
    /// and the message is created without a parent.
    pub fn create_message(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        content: &str,
        parent_message_id: Option<Uuid>,
    ) -> ChatResult<Message> {
        let content = valid_content(content)?;
        self.require_member(channel_id, user_id)?;

        let message = self
            .db
            .insert_message(channel_id, user_id, content, parent_message_id)
            .during("create_message")?;

        if parent_message_id.is_some() && message.parent_message_id.is_none() {
            debug!(
                "dropped unresolved parent {:?} on message {}",
                parent_message_id, message.id
            );
        }
        Ok(message)
    }

    pub fn edit_message(&self, message_id: Uuid, user_id: Uuid, new_content: &str) -> ChatResult<Message> {
        let content = valid_content(new_content)?;
        let updated = self
            .db
            .edit_message(message_id, user_id, content)
            .during("edit_message")?;
        if updated == 0 {
            return Err(self.explain_unmodified(message_id)?);
        }
        self.require_message(message_id)
    }

    /// Soft delete. Deleting an already deleted message of one's own succeeds.
    pub fn delete_message(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<Message> {
        let updated = self
            .db
            .soft_delete_message(message_id, user_id)
            .during("delete_message")?;
        if updated == 0 {
            return Err(match self.db.get_message(message_id).during("delete_message")? {
                Some(_) => ChatError::Forbidden,
                None => ChatError::NotFound("message"),
            });
        }
        self.require_message(message_id)
    }

    pub fn mark_messages_as_read(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<usize> {
        self.require_member(channel_id, user_id)?;
        self.db
            .mark_channel_read(channel_id, user_id)
            .during("mark_messages_as_read")
    }

    /// Unread count per channel the user belongs to, zero included.
    pub fn get_unread_count(&self, user_id: Uuid) -> ChatResult<HashMap<Uuid, u64>> {
        let counts = self.db.unread_counts(user_id).during("get_unread_count")?;
        Ok(counts.into_iter().collect())
    }

    // -- Reactions --

    /// Idempotent. Returns the channel of the reacted message and whether a
    /// reaction row was actually inserted.
    pub fn add_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> ChatResult<(Uuid, bool)> {
        let emoji = required(emoji, "emoji")?;
        let channel_id = self.reactable_channel(message_id, user_id)?;
        let added = self
            .db
            .add_reaction(message_id, user_id, emoji)
            .during("add_reaction")?;
        Ok((channel_id, added))
    }

    /// Removes exactly the matching triple; a missing reaction is not an
    /// error and reports `false`.
    pub fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> ChatResult<(Uuid, bool)> {
        let emoji = required(emoji, "emoji")?;
        let channel_id = self.reactable_channel(message_id, user_id)?;
        let removed = self
            .db
            .remove_reaction(message_id, user_id, emoji)
            .during("remove_reaction")?;
        Ok((channel_id, removed))
    }

    // -- Public feed --

    /// One page (1-based) of the public channel with author and reply
    /// previews joined in.
    pub fn get_public_channel_messages(&self, page: u32, limit: u32) -> ChatResult<PublicChannelPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = u64::from(page - 1) * u64::from(limit);

        let channel = self
            .db
            .public_channel()
            .during("get_public_channel_messages")?
            .ok_or(ChatError::NotFound("public channel"))?;
        let total = self
            .db
            .count_channel_messages(channel.id)
            .during("get_public_channel_messages")?;
        let messages = self
            .db
            .channel_message_views(channel.id, limit, offset)
            .during("get_public_channel_messages")?;

        let has_more = offset + (messages.len() as u64) < total;
        Ok(PublicChannelPage {
            channel,
            messages,
            page,
            limit,
            total,
            has_more,
        })
    }

    // -- Helpers --

    fn require_channel(&self, channel_id: Uuid) -> ChatResult<Channel> {
        self.db
            .get_channel(channel_id)
            .during("get_channel")?
            .ok_or(ChatError::NotFound("channel"))
    }

    fn require_member(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        if self.is_channel_member(channel_id, user_id)? {
            Ok(())
        } else {
            Err(ChatError::AccessDenied)
        }
    }

    fn require_message(&self, message_id: Uuid) -> ChatResult<Message> {
        self.db
            .get_message(message_id)
            .during("get_message")?
            .ok_or(ChatError::NotFound("message"))
    }

    /// Live message the caller may react to, resolved to its channel.
    fn reactable_channel(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<Uuid> {
        let message = self.require_message(message_id)?;
        if message.is_deleted {
            return Err(ChatError::NotFound("message"));
        }
        self.require_member(message.channel_id, user_id)?;
        Ok(message.channel_id)
    }

    /// Zero rows from an author-guarded update: tell "gone" from "not yours".
    fn explain_unmodified(&self, message_id: Uuid) -> ChatResult<ChatError> {
        Ok(match self.db.get_message(message_id).during("get_message")? {
            Some(m) if !m.is_deleted => ChatError::Forbidden,
            _ => ChatError::NotFound("message"),
        })
    }
}

fn required<'a>(value: &'a str, field: &str) -> ChatResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

fn valid_content(content: &str) -> ChatResult<&str> {
    if content.trim().is_empty() {
        return Err(ChatError::InvalidInput("message content must not be empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::InvalidInput(format!(
            "message content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(content)
}
