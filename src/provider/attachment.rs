//! In-platform attachment backend.
//!
//! A message link inside the chat platform resolves to a media attachment
//! through the gateway's file-download capability. Files above the
//! configured size cap are rejected before any bytes move.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

use super::traits::MediaSource;
use crate::gateway::{AttachmentRef, ChatGateway};
use crate::models::{Platform, Track};
use crate::{Error, Result};

/// Public (`t.me/<name>/<id>`) and private (`t.me/c/<chat>/<id>`) message
/// links.
static MESSAGE_LINK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?t\.me/(?:c/\d+|[a-zA-Z0-9_]{5,})/\d+/?$")
        .expect("static regex")
});

enum Target {
    /// A pasted message link, resolved through the gateway on demand.
    Link(String),
    /// An attachment already in hand (replied-to media message).
    Resolved(AttachmentRef),
}

pub struct AttachmentSource {
    target: Target,
    gateway: Arc<dyn ChatGateway>,
    downloads_dir: PathBuf,
    max_file_size: u64,
}

impl AttachmentSource {
    pub fn new(
        query: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
        downloads_dir: PathBuf,
        max_file_size: u64,
    ) -> Self {
        Self {
            target: Target::Link(query.into().trim().to_string()),
            gateway,
            downloads_dir,
            max_file_size,
        }
    }

    pub fn from_ref(
        attachment: AttachmentRef,
        gateway: Arc<dyn ChatGateway>,
        downloads_dir: PathBuf,
        max_file_size: u64,
    ) -> Self {
        Self {
            target: Target::Resolved(attachment),
            gateway,
            downloads_dir,
            max_file_size,
        }
    }

    #[must_use]
    pub fn matches_url(url: &str) -> bool {
        MESSAGE_LINK_PATTERN.is_match(url)
    }

    async fn resolve(&self) -> Result<AttachmentRef> {
        let attachment = match &self.target {
            Target::Link(link) => self.gateway.resolve_message_link(link).await?,
            Target::Resolved(attachment) => attachment.clone(),
        };

        if attachment.file_size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size_mb: attachment.file_size / (1024 * 1024),
                limit_mb: self.max_file_size / (1024 * 1024),
            });
        }
        Ok(attachment)
    }

    fn to_track(attachment: &AttachmentRef) -> Track {
        Track {
            id: format!("{}_{}", attachment.chat.get(), attachment.message_id),
            platform: Platform::Attachment,
            url: String::new(),
            title: attachment.file_name.clone(),
            duration_secs: 0,
            cover_url: None,
            cdn_url: None,
            decrypt_key: None,
            lyrics: None,
        }
    }
}

#[async_trait]
impl MediaSource for AttachmentSource {
    fn is_valid(&self) -> bool {
        match &self.target {
            Target::Link(link) => Self::matches_url(link),
            Target::Resolved(_) => true,
        }
    }

    async fn get_info(&self) -> Result<Vec<Track>> {
        let attachment = self.resolve().await?;
        Ok(vec![Self::to_track(&attachment)])
    }

    async fn search(&self) -> Result<Vec<Track>> {
        self.get_info().await
    }

    async fn get_track(&self) -> Result<Track> {
        let attachment = self.resolve().await?;
        Ok(Self::to_track(&attachment))
    }

    async fn download(&self, _track: &Track, _is_video: bool) -> Result<PathBuf> {
        let attachment = self.resolve().await?;
        let dest = self.downloads_dir.join(&attachment.file_name);
        self.gateway.download_attachment(&attachment, &dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatId;

    #[test]
    fn test_message_link_patterns() {
        assert!(AttachmentSource::matches_url("https://t.me/somechannel/123"));
        assert!(AttachmentSource::matches_url("t.me/c/1234567890/42"));
        assert!(AttachmentSource::matches_url("https://t.me/c/1234567890/42/"));

        assert!(!AttachmentSource::matches_url("https://t.me/abc"));
        assert!(!AttachmentSource::matches_url(
            "https://www.youtube.com/watch?v=abc"
        ));
        assert!(!AttachmentSource::matches_url("some song name"));
    }

    #[test]
    fn test_track_identity_from_message() {
        let attachment = AttachmentRef {
            chat: ChatId(-100123),
            message_id: 42,
            file_name: "mix.mp3".to_string(),
            file_size: 1024,
            is_video: false,
        };
        let track = AttachmentSource::to_track(&attachment);
        assert_eq!(track.id, "-100123_42");
        assert_eq!(track.platform, Platform::Attachment);
        assert_eq!(track.title, "mix.mp3");
    }
}
