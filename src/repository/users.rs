//! Known-users repository, used for reach statistics and broadcasts.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::UserId;
use crate::Result;

/// A user the bot has interacted with at least once.
#[derive(Debug, Clone)]
pub struct KnownUser {
    pub id: UserId,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a user the bot has interacted with. Idempotent.
    pub async fn add_user(&self, user: UserId) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO users (id) VALUES ($1)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(user)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_users(&self) -> Result<Vec<KnownUser>> {
        let rows = sqlx::query("SELECT id, joined_at FROM users ORDER BY joined_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(KnownUser {
                    id: row.try_get("id")?,
                    joined_at: row.try_get("joined_at")?,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}
