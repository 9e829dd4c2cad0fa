//! Chat settings repository.
//!
//! Persists per-chat play/admin modes, the sticky assistant assignment and
//! the authorized-user list. Reads go through an in-memory cache with a
//! 20-minute TTL; writes go through to Postgres and invalidate the cached
//! document.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;

use super::ChatStore;
use crate::models::{AccessMode, AssistantKey, ChatId, ChatSettings, UserId};
use crate::Result;

#[derive(Clone)]
pub struct ChatRepository {
    pool: PgPool,
    cache: Arc<moka::future::Cache<ChatId, ChatSettings>>,
}

impl std::fmt::Debug for ChatRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRepository").finish()
    }
}

impl ChatRepository {
    /// Read-cache capacity (max chats held in memory)
    pub const CACHE_SIZE: u64 = 1_000;
    /// Read-cache TTL in seconds
    pub const CACHE_TTL_SECS: u64 = 20 * 60;

    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(
                moka::future::CacheBuilder::new(Self::CACHE_SIZE)
                    .time_to_live(Duration::from_secs(Self::CACHE_TTL_SECS))
                    .build(),
            ),
        }
    }

    /// Evict a chat's cached document (e.g. after an external write).
    pub async fn invalidate(&self, chat: ChatId) {
        self.cache.invalidate(&chat).await;
    }
}

#[async_trait]
impl ChatStore for ChatRepository {
    /// Fetch a chat's settings, defaulting when the chat has no row yet.
    async fn settings(&self, chat: ChatId) -> Result<ChatSettings> {
        if let Some(settings) = self.cache.get(&chat).await {
            return Ok(settings);
        }

        let row = sqlx::query(
            r"
            SELECT play_mode, admin_mode, assistant, auth_users
            FROM chats
            WHERE id = $1
            ",
        )
        .bind(chat)
        .fetch_optional(&self.pool)
        .await?;

        let settings = match row {
            Some(row) => {
                let play_mode: String = row.try_get("play_mode")?;
                let admin_mode: String = row.try_get("admin_mode")?;
                let assistant: Option<String> = row.try_get("assistant")?;
                let auth_users: Vec<i64> = row.try_get("auth_users")?;
                ChatSettings {
                    play_mode: play_mode
                        .parse::<AccessMode>()
                        .unwrap_or(AccessMode::Everyone),
                    admin_mode: admin_mode.parse::<AccessMode>().unwrap_or(AccessMode::Admins),
                    assistant: assistant.map(AssistantKey::from),
                    auth_users: auth_users.into_iter().map(UserId::from).collect(),
                }
            }
            None => ChatSettings::default(),
        };

        self.cache.insert(chat, settings.clone()).await;
        Ok(settings)
    }

    async fn set_play_mode(&self, chat: ChatId, mode: AccessMode) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO chats (id, play_mode) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET play_mode = EXCLUDED.play_mode
            ",
        )
        .bind(chat)
        .bind(mode.to_string())
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&chat).await;
        Ok(())
    }

    async fn set_admin_mode(&self, chat: ChatId, mode: AccessMode) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO chats (id, admin_mode) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET admin_mode = EXCLUDED.admin_mode
            ",
        )
        .bind(chat)
        .bind(mode.to_string())
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&chat).await;
        Ok(())
    }

    async fn assistant(&self, chat: ChatId) -> Result<Option<AssistantKey>> {
        Ok(self.settings(chat).await?.assistant)
    }

    async fn set_assistant(&self, chat: ChatId, key: &AssistantKey) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO chats (id, assistant) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET assistant = EXCLUDED.assistant
            ",
        )
        .bind(chat)
        .bind(key)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&chat).await;
        tracing::info!(chat = %chat, assistant = %key, "Assistant bound to chat");
        Ok(())
    }

    async fn remove_assistant(&self, chat: ChatId) -> Result<()> {
        sqlx::query("UPDATE chats SET assistant = NULL WHERE id = $1")
            .bind(chat)
            .execute(&self.pool)
            .await?;

        self.cache.invalidate(&chat).await;
        Ok(())
    }

    async fn auth_users(&self, chat: ChatId) -> Result<Vec<UserId>> {
        Ok(self.settings(chat).await?.auth_users)
    }

    async fn add_auth_user(&self, chat: ChatId, user: UserId) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO chats (id, auth_users) VALUES ($1, ARRAY[$2]::BIGINT[])
            ON CONFLICT (id) DO UPDATE
            SET auth_users = (
                SELECT ARRAY(SELECT DISTINCT unnest(chats.auth_users || $2))
            )
            ",
        )
        .bind(chat)
        .bind(user)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&chat).await;
        Ok(())
    }

    async fn remove_auth_user(&self, chat: ChatId, user: UserId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE chats SET auth_users = array_remove(auth_users, $2)
            WHERE id = $1
            ",
        )
        .bind(chat)
        .bind(user)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&chat).await;
        Ok(())
    }
}
