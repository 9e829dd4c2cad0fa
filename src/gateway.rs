//! Messaging-platform seam.
//!
//! The core never talks to the chat protocol directly; everything it needs
//! from the platform (messages, rosters, membership changes, file
//! downloads) goes through [`ChatGateway`] (the bot identity) and
//! [`UserSession`] (a full-user assistant identity). The wiring layer
//! implements these over the real SDK; tests implement them in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{AdminEntry, ChatId, MemberStatus, UserId};
use crate::Result;

/// Handle to a sent chat message, for later in-place edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub chat: ChatId,
    pub message_id: i64,
}

/// A media message referenced by an in-platform link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub chat: ChatId,
    pub message_id: i64,
    pub file_name: String,
    pub file_size: u64,
    pub is_video: bool,
}

/// Outcome of an assistant's attempt to join a chat via invite link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The chat requires approval; a join request is now pending.
    RequestSent,
    AlreadyParticipant,
    /// The link no longer works: expired, or the account is banned.
    InviteExpired,
}

/// A membership change observed in a chat.
#[derive(Debug, Clone)]
pub struct ParticipantChange {
    pub chat: ChatId,
    pub user: UserId,
    pub new_status: MemberStatus,
}

/// Bot-identity operations the core consumes from the messaging platform.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageRef>;

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()>;

    async fn chat_member(&self, chat: ChatId, user: UserId) -> Result<MemberStatus>;

    /// The chat's full administrator roster.
    async fn chat_administrators(&self, chat: ChatId) -> Result<Vec<AdminEntry>>;

    async fn create_invite_link(&self, chat: ChatId) -> Result<String>;

    /// Lift a ban or restriction, returning the user to plain membership.
    async fn promote_to_member(&self, chat: ChatId, user: UserId) -> Result<()>;

    async fn approve_join_request(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Resolve a public or private message link to its media attachment.
    async fn resolve_message_link(&self, link: &str) -> Result<AttachmentRef>;

    /// Download an attachment's bytes to `dest`.
    async fn download_attachment(&self, attachment: &AttachmentRef, dest: &Path)
        -> Result<PathBuf>;

    fn bot_user_id(&self) -> UserId;
}

/// Full-user session operations; only these identities can sit in a voice
/// conference.
#[async_trait]
pub trait UserSession: Send + Sync {
    fn user_id(&self) -> UserId;

    async fn join_chat(&self, invite_link: &str) -> Result<JoinOutcome>;

    async fn close(&self) -> Result<()>;
}
