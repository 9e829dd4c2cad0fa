//! Chat-keyed call routing.
//!
//! Every engine operation goes through the chat's bound assistant; the
//! router resolves chat → session via the pool and hands the engine a
//! shell-source descriptor. Seek and speed changes are re-issued plays
//! with adjusted transcoder parameters.

use std::path::Path;
use std::sync::Arc;

use super::descriptor::{self, DescriptorParams};
use crate::models::ChatId;
use crate::queue::ChatQueueStore;
use crate::service::assistant::AssistantPool;
use crate::{Error, Result};

/// Playback speed envelope.
pub const MIN_SPEED: f64 = 0.5;
pub const MAX_SPEED: f64 = 4.0;

pub struct CallRouter {
    assistants: Arc<AssistantPool>,
    queue: Arc<ChatQueueStore>,
}

impl std::fmt::Debug for CallRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRouter").finish()
    }
}

impl CallRouter {
    #[must_use]
    pub fn new(assistants: Arc<AssistantPool>, queue: Arc<ChatQueueStore>) -> Self {
        Self { assistants, queue }
    }

    /// Start (or replace) the chat's stream from a local path or URL.
    pub async fn play_media(
        &self,
        chat: ChatId,
        source: &str,
        is_video: bool,
        params: &DescriptorParams,
    ) -> Result<()> {
        if !descriptor::is_remote(source) && !Path::new(source).exists() {
            return Err(Error::Engine(format!(
                "Media file not found: {source}; it may have been deleted"
            )));
        }

        let session = self.assistants.session_for(chat).await?;
        let media = descriptor::build_descriptor(source, is_video, params);
        tracing::info!(chat = %chat, source, is_video, "Playing media");
        session.engine.play(chat, &media).await
    }

    pub async fn pause(&self, chat: ChatId) -> Result<()> {
        let session = self.assistants.session_for(chat).await?;
        session.engine.pause(chat).await
    }

    pub async fn resume(&self, chat: ChatId) -> Result<()> {
        let session = self.assistants.session_for(chat).await?;
        session.engine.resume(chat).await
    }

    pub async fn mute(&self, chat: ChatId) -> Result<()> {
        let session = self.assistants.session_for(chat).await?;
        session.engine.mute(chat).await
    }

    pub async fn unmute(&self, chat: ChatId) -> Result<()> {
        let session = self.assistants.session_for(chat).await?;
        session.engine.unmute(chat).await
    }

    /// Leave the chat's conference. Queue state is the coordinator's to
    /// clean up.
    pub async fn stop(&self, chat: ChatId) -> Result<()> {
        let session = self.assistants.session_for(chat).await?;
        tracing::info!(chat = %chat, "Leaving voice conference");
        session.engine.leave(chat).await
    }

    pub async fn played_time(&self, chat: ChatId) -> Result<u32> {
        let session = self.assistants.session_for(chat).await?;
        session.engine.played_seconds(chat).await
    }

    /// Restart the stream at `to_secs`, bounded by the track duration.
    pub async fn seek(
        &self,
        chat: ChatId,
        source: &str,
        to_secs: u32,
        duration_secs: u32,
        is_video: bool,
    ) -> Result<()> {
        if duration_secs == 0 {
            return Err(Error::InvalidInput(
                "Cannot seek: track duration unknown".to_string(),
            ));
        }
        let params = descriptor::seek_params(source, to_secs, duration_secs);
        self.play_media(chat, source, is_video, &params).await
    }

    /// Re-issue the current track at a different speed.
    pub async fn change_speed(&self, chat: ChatId, factor: f64) -> Result<()> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&factor) {
            return Err(Error::InvalidInput(format!(
                "Speed must be between {MIN_SPEED} and {MAX_SPEED}"
            )));
        }

        let current = self
            .queue
            .playing(chat)
            .ok_or_else(|| Error::InvalidInput("No track currently playing".to_string()))?;
        let path = current.local_path.as_ref().ok_or_else(|| {
            Error::InvalidInput("Current track has no local media to re-time".to_string())
        })?;

        let params = descriptor::speed_params(factor, current.is_video);
        self.play_media(chat, &path.to_string_lossy(), current.is_video, &params)
            .await
    }
}
