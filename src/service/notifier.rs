//! User-visible notifications.
//!
//! The coordinator reports playback events through [`Notifier`]; the
//! default implementation renders chat messages over the gateway.
//! Notifications are best-effort: failures are logged, never propagated
//! into playback state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::gateway::{ChatGateway, MessageRef};
use crate::models::{ChatId, QueuedTrack, Track, UserId};
use crate::repository::BotRepository;
use crate::Result;

/// Events the playback engine surfaces to the chat.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn now_playing(&self, chat: ChatId, track: &QueuedTrack);

    async fn queued(&self, chat: ChatId, position: usize, track: &Track);

    async fn queue_finished(&self, chat: ChatId);

    async fn error(&self, chat: ChatId, kind: &str, detail: &str);
}

/// A status message edited in place as an operation progresses.
///
/// Single-writer: an edit is skipped when the body is unchanged, and two
/// successful edits are spaced at least [`Self::MIN_EDIT_GAP`] apart.
pub struct StatusMessage {
    gateway: Arc<dyn ChatGateway>,
    message: MessageRef,
    state: Mutex<EditState>,
}

struct EditState {
    last_body: String,
    last_edit: Option<Instant>,
}

impl StatusMessage {
    pub const MIN_EDIT_GAP: Duration = Duration::from_millis(500);

    /// Send the initial status message.
    pub async fn send(gateway: Arc<dyn ChatGateway>, chat: ChatId, text: &str) -> Result<Self> {
        let message = gateway.send_message(chat, text).await?;
        Ok(Self {
            gateway,
            message,
            state: Mutex::new(EditState {
                last_body: text.to_string(),
                last_edit: Some(Instant::now()),
            }),
        })
    }

    /// Edit the message in place, deduplicating and pacing edits.
    pub async fn edit(&self, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.last_body == text {
            return Ok(());
        }

        if let Some(last_edit) = state.last_edit {
            let since = last_edit.elapsed();
            if since < Self::MIN_EDIT_GAP {
                tokio::time::sleep(Self::MIN_EDIT_GAP - since).await;
            }
        }

        self.gateway.edit_message(&self.message, text).await?;
        state.last_body = text.to_string();
        state.last_edit = Some(Instant::now());
        Ok(())
    }
}

/// Default notifier: plain chat messages, plus an optional per-play log
/// broadcast to the operator's logger chat.
pub struct ChatNotifier {
    gateway: Arc<dyn ChatGateway>,
    bot_repo: Option<BotRepository>,
    bot_id: UserId,
    logger_chat: Option<ChatId>,
}

impl ChatNotifier {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        bot_repo: Option<BotRepository>,
        bot_id: UserId,
        logger_chat: Option<ChatId>,
    ) -> Self {
        Self {
            gateway,
            bot_repo,
            bot_id,
            logger_chat,
        }
    }

    async fn send(&self, chat: ChatId, text: String) {
        if let Err(e) = self.gateway.send_message(chat, &text).await {
            tracing::warn!(chat = %chat, error = %e, "Failed to send notification");
        }
    }

    async fn broadcast_play_log(&self, chat: ChatId, track: &QueuedTrack) {
        let (Some(repo), Some(logger_chat)) = (&self.bot_repo, self.logger_chat) else {
            return;
        };
        match repo.logger_enabled(self.bot_id).await {
            Ok(true) => {
                let line = format!(
                    "▶️ {} ({}) requested by {} in chat {}",
                    track.track.title, track.track.platform, track.requested_by, chat
                );
                self.send(logger_chat, line).await;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read logger flag"),
        }
    }
}

fn format_duration(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn now_playing(&self, chat: ChatId, track: &QueuedTrack) {
        let text = format!(
            "Now playing: {}\nDuration: {}\nRequested by: {}",
            track.track.title,
            format_duration(track.track.duration_secs),
            track.requested_by
        );
        self.send(chat, text).await;
        self.broadcast_play_log(chat, track).await;
    }

    async fn queued(&self, chat: ChatId, position: usize, track: &Track) {
        self.send(chat, format!("Queued at #{position}: {}", track.title))
            .await;
    }

    async fn queue_finished(&self, chat: ChatId) {
        self.send(
            chat,
            "Queue finished. Use /play to add more songs!".to_string(),
        )
        .await;
    }

    async fn error(&self, chat: ChatId, kind: &str, detail: &str) {
        tracing::warn!(chat = %chat, kind, detail, "Reporting playback failure");
        self.send(chat, format!("⚠️ {detail}")).await;
    }
}
