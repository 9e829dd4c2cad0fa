use thiserror::Error;

use crate::models::AssistantKey;

#[derive(Error, Debug)]
pub enum Error {
    /// The caller is not allowed to run this command in this chat.
    #[error("Not allowed: {0}")]
    Admission(String),

    /// The bot itself lacks the rights it needs before any chat command can
    /// run (present + admin + invite-users).
    #[error("Bot needs admin rights: {0}")]
    BotNotAdmin(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Queue is full ({len} tracks queued)")]
    QueueFull { len: usize },

    #[error("File too large: {size_mb} MB exceeds the {limit_mb} MB limit")]
    FileTooLarge { size_mb: u64, limit_mb: u64 },

    #[error("Network error: {0}")]
    Network(String),

    /// The catalog answered but had nothing for us.
    #[error("No results: {0}")]
    Resolution(String),

    /// Downloading or transcoding the media failed.
    #[error("Download failed: {0}")]
    Materialization(String),

    #[error("Call engine error: {0}")]
    Engine(String),

    /// The assistant session cannot attend the voice conference.
    #[error("Assistant {key} unavailable: {reason}")]
    Assistant { key: AssistantKey, reason: String },

    #[error("Operation timed out: {0}")]
    Deadline(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Deadline(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl Error {
    /// Short machine-readable kind, used for notification routing and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Admission(_) => "admission",
            Self::BotNotAdmin(_) => "bot_not_admin",
            Self::InvalidInput(_) => "input",
            Self::QueueFull { .. } | Self::FileTooLarge { .. } => "capacity",
            Self::Network(_) => "network",
            Self::Resolution(_) => "resolution",
            Self::Materialization(_) => "materialization",
            Self::Engine(_) => "engine",
            Self::Assistant { .. } => "assistant",
            Self::Deadline(_) => "deadline",
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Admission("x".into()).kind(), "admission");
        assert_eq!(Error::QueueFull { len: 10 }.kind(), "capacity");
        assert_eq!(
            Error::FileTooLarge {
                size_mb: 501,
                limit_mb: 500
            }
            .kind(),
            "capacity"
        );
        assert_eq!(Error::Deadline("slow".into()).kind(), "deadline");
    }

    #[test]
    fn test_file_too_large_names_the_limit() {
        let err = Error::FileTooLarge {
            size_mb: 501,
            limit_mb: 500,
        };
        let msg = err.to_string();
        assert!(msg.contains("500 MB"));
    }
}
