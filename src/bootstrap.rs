//! Startup sequence helpers.
//!
//! The binary that wires the chat SDK and the native engine calls these in
//! order: configuration, logging, database, filesystem, cookie
//! materialization. Each step fails fast when the process cannot work.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::time::Duration;

use crate::config::{Config, DownloadsConfig};

/// Load configuration from the default locations, failing on malformed
/// input. Missing credentials are reported by `Config::validate`.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = Config::load(path)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!("Config validation error: {error}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }
    Ok(config)
}

/// Connect to Postgres, verify the connection with a ping, and create the
/// schema if it is not there yet.
pub async fn init_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .connect(&config.database.url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    tracing::info!("Database connection completed");

    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS chats (
            id          BIGINT PRIMARY KEY,
            play_mode   TEXT NOT NULL DEFAULT 'everyone',
            admin_mode  TEXT NOT NULL DEFAULT 'admins',
            assistant   TEXT,
            auth_users  BIGINT[] NOT NULL DEFAULT '{}'
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS users (
            id         BIGINT PRIMARY KEY,
            joined_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS bot (
            id      BIGINT PRIMARY KEY,
            logger  BOOLEAN NOT NULL DEFAULT FALSE
        )
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the downloads and cookies directories, owner-and-group only.
pub fn init_directories(config: &DownloadsConfig) -> anyhow::Result<()> {
    for dir in [&config.dir, &config.cookies_dir] {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))?;
        }
    }
    Ok(())
}

/// Materialize downloader cookie files from the configured raw-paste URLs.
/// Individual failures are logged and skipped; rotation tolerates gaps.
pub async fn fetch_cookies(config: &DownloadsConfig) -> anyhow::Result<usize> {
    if config.cookie_urls.is_empty() {
        return Ok(0);
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let mut written = 0usize;
    for (index, url) in config.cookie_urls.iter().enumerate() {
        match fetch_one_cookie(&client, url).await {
            Ok(body) => {
                let path = config.cookies_dir.join(format!("cookie_{index}.txt"));
                tokio::fs::write(&path, body).await?;
                written += 1;
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "Failed to fetch cookie file");
            }
        }
    }

    tracing::info!(count = written, "Cookie files materialized");
    Ok(written)
}

async fn fetch_one_cookie(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("{url} returned {}", response.status());
    }
    Ok(response.text().await?)
}
