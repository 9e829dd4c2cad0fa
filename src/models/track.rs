use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Catalog a track came from.
///
/// The platform plus the track id form the dedupe key within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    Spotify,
    AppleMusic,
    Soundcloud,
    /// Media message attached in the chat itself.
    Attachment,
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "youtube" => Ok(Self::Youtube),
            "spotify" => Ok(Self::Spotify),
            "apple_music" | "applemusic" => Ok(Self::AppleMusic),
            "soundcloud" => Ok(Self::Soundcloud),
            "attachment" | "telegram" => Ok(Self::Attachment),
            _ => Err(format!("Unknown platform: {s}")),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Youtube => write!(f, "youtube"),
            Self::Spotify => write!(f, "spotify"),
            Self::AppleMusic => write!(f, "apple_music"),
            Self::Soundcloud => write!(f, "soundcloud"),
            Self::Attachment => write!(f, "attachment"),
        }
    }
}

/// A resolved track: enough metadata to show the user and, for direct
/// catalog sources, to fetch the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Opaque id, unique within `platform`.
    pub id: String,
    pub platform: Platform,
    /// Canonical URL on the source platform.
    pub url: String,
    pub title: String,
    /// 0 when the catalog did not report one; probed after download.
    #[serde(default)]
    pub duration_secs: u32,
    #[serde(default)]
    pub cover_url: Option<String>,
    /// Direct byte source, when the catalog hands one out.
    #[serde(default)]
    pub cdn_url: Option<String>,
    /// Hex AES key for encrypted CDN payloads (platform-dependent).
    #[serde(default)]
    pub decrypt_key: Option<String>,
    #[serde(default)]
    pub lyrics: Option<String>,
}

impl Track {
    /// Dedupe key within a queue.
    #[must_use]
    pub fn dedupe_key(&self) -> (Platform, &str) {
        (self.platform, &self.id)
    }
}

/// A track sitting in a chat's queue.
#[derive(Debug, Clone)]
pub struct QueuedTrack {
    pub track: Track,
    /// Display name of the requesting user, for "requested by" lines.
    pub requested_by: String,
    /// Set once the media has been materialized on disk. The queue owns the
    /// file and unlinks it when the entry leaves the head position.
    pub local_path: Option<PathBuf>,
    pub is_video: bool,
    /// Replays remaining for the head entry. Meaningless below index 0.
    pub loop_remaining: u8,
}

impl QueuedTrack {
    #[must_use]
    pub fn new(track: Track, requested_by: String, is_video: bool) -> Self {
        Self {
            track,
            requested_by,
            local_path: None,
            is_video,
            loop_remaining: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(platform: Platform, id: &str) -> Track {
        Track {
            id: id.to_string(),
            platform,
            url: format!("https://example.com/{id}"),
            title: "t".to_string(),
            duration_secs: 0,
            cover_url: None,
            cdn_url: None,
            decrypt_key: None,
            lyrics: None,
        }
    }

    #[test]
    fn test_platform_round_trip() {
        for p in [
            Platform::Youtube,
            Platform::Spotify,
            Platform::AppleMusic,
            Platform::Soundcloud,
            Platform::Attachment,
        ] {
            assert_eq!(p.to_string().parse::<Platform>().unwrap(), p);
        }
        assert!("vimeo".parse::<Platform>().is_err());
    }

    #[test]
    fn test_dedupe_key_distinguishes_platforms() {
        let a = track(Platform::Youtube, "abc");
        let b = track(Platform::Spotify, "abc");
        assert_ne!(a.dedupe_key(), b.dedupe_key());
        assert_eq!(a.dedupe_key(), track(Platform::Youtube, "abc").dedupe_key());
    }
}
