//! Bot-level flags, keyed by the bot's own user id.

use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;

use crate::models::UserId;
use crate::Result;

#[derive(Clone)]
pub struct BotRepository {
    pool: PgPool,
    cache: Arc<moka::future::Cache<UserId, bool>>,
}

impl std::fmt::Debug for BotRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRepository").finish()
    }
}

impl BotRepository {
    pub const CACHE_TTL_SECS: u64 = 20 * 60;

    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(
                moka::future::CacheBuilder::new(16)
                    .time_to_live(Duration::from_secs(Self::CACHE_TTL_SECS))
                    .build(),
            ),
        }
    }

    /// Whether per-play log broadcasts are enabled for this bot.
    pub async fn logger_enabled(&self, bot: UserId) -> Result<bool> {
        if let Some(enabled) = self.cache.get(&bot).await {
            return Ok(enabled);
        }

        let row = sqlx::query("SELECT logger FROM bot WHERE id = $1")
            .bind(bot)
            .fetch_optional(&self.pool)
            .await?;

        let enabled = match row {
            Some(row) => row.try_get("logger")?,
            None => false,
        };
        self.cache.insert(bot, enabled).await;
        Ok(enabled)
    }

    pub async fn set_logger_enabled(&self, bot: UserId, enabled: bool) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO bot (id, logger) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET logger = EXCLUDED.logger
            ",
        )
        .bind(bot)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(&bot).await;
        Ok(())
    }
}
