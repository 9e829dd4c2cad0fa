pub mod bot;
pub mod chats;
pub mod users;

pub use bot::BotRepository;
pub use chats::ChatRepository;
pub use users::UserRepository;

use async_trait::async_trait;

use crate::models::{AccessMode, AssistantKey, ChatId, ChatSettings, UserId};
use crate::Result;

/// Persisted per-chat state the core reads and writes.
///
/// [`ChatRepository`] is the production implementation; tests inject an
/// in-memory double.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn settings(&self, chat: ChatId) -> Result<ChatSettings>;

    async fn set_play_mode(&self, chat: ChatId, mode: AccessMode) -> Result<()>;

    async fn set_admin_mode(&self, chat: ChatId, mode: AccessMode) -> Result<()>;

    async fn assistant(&self, chat: ChatId) -> Result<Option<AssistantKey>>;

    async fn set_assistant(&self, chat: ChatId, key: &AssistantKey) -> Result<()>;

    async fn remove_assistant(&self, chat: ChatId) -> Result<()>;

    async fn auth_users(&self, chat: ChatId) -> Result<Vec<UserId>>;

    async fn add_auth_user(&self, chat: ChatId, user: UserId) -> Result<()>;

    async fn remove_auth_user(&self, chat: ChatId, user: UserId) -> Result<()>;
}
