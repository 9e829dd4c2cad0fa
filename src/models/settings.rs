use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{AssistantKey, UserId};

/// Who may run a class of commands in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Chat administrators only.
    Admins,
    /// Administrators plus the chat's authorized-user list.
    Auth,
    Everyone,
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admins" => Ok(Self::Admins),
            "auth" => Ok(Self::Auth),
            "everyone" => Ok(Self::Everyone),
            _ => Err(format!("Unknown access mode: {s}")),
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admins => write!(f, "admins"),
            Self::Auth => write!(f, "auth"),
            Self::Everyone => write!(f, "everyone"),
        }
    }
}

/// Persisted per-chat settings, one document per chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Who may enqueue tracks.
    pub play_mode: AccessMode,
    /// Who may run control commands (skip, stop, ...).
    pub admin_mode: AccessMode,
    /// Sticky assistant assignment; survives restarts until removed.
    pub assistant: Option<AssistantKey>,
    /// Users granted command rights beside the admins.
    pub auth_users: Vec<UserId>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            play_mode: AccessMode::Everyone,
            admin_mode: AccessMode::Admins,
            assistant: None,
            auth_users: Vec::new(),
        }
    }
}
