//! Generic catalog API backend.
//!
//! Covers the streaming services the external catalog fronts (spotify,
//! apple music, soundcloud) plus the video site's music sub-host. The API
//! returns normalized track lists for URLs and searches, and a direct CDN
//! byte source per track; spotify payloads arrive encrypted and run
//! through the OGG pipeline.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use once_cell::sync::Lazy;
use std::sync::Arc;

use super::crypto;
use super::http::HttpClient;
use super::traits::MediaSource;
use crate::models::{Platform, Track};
use crate::{Error, Result};

static SPOTIFY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(https?://)?([a-z0-9-]+\.)*spotify\.com/(track|playlist|album|artist)/[a-zA-Z0-9]+(\?.*)?$",
    )
    .expect("static regex")
});

static APPLE_MUSIC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(https?://)?([a-z0-9-]+\.)*music\.apple\.com/([a-z]{2}/)?(album|playlist|song)/[a-zA-Z0-9\-._]+/(pl\.[a-zA-Z0-9]+|\d+)(\?.*)?$",
    )
    .expect("static regex")
});

static SOUNDCLOUD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(https?://)?([a-z0-9-]+\.)*soundcloud\.com/[a-zA-Z0-9_-]+(/(sets)?/?[a-zA-Z0-9_-]+)?(\?.*)?$",
    )
    .expect("static regex")
});

/// The video site's music sub-host is served by the catalog API, not the
/// video backend.
static MUSIC_SUBHOST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(https?://)?music\.youtube\.com/(watch\?v=|playlist\?list=)[\w-]+")
        .expect("static regex")
});

/// Wire format of `/get_url` and `/search` entries.
#[derive(Debug, Deserialize)]
struct ApiTrack {
    url: String,
    name: String,
    id: String,
    #[serde(default)]
    cover: String,
    #[serde(default)]
    duration: u32,
    platform: String,
}

#[derive(Debug, Deserialize)]
struct ApiTrackList {
    results: Vec<ApiTrack>,
}

/// Wire format of `/track`.
#[derive(Debug, Deserialize)]
struct ApiTrackInfo {
    url: String,
    #[serde(default)]
    cdnurl: String,
    #[serde(default)]
    key: String,
    name: String,
    tc: String,
    #[serde(default)]
    cover: String,
    #[serde(default)]
    duration: u32,
    platform: String,
    #[serde(default)]
    lyrics: Option<String>,
}

pub struct ApiSource {
    query: String,
    base_url: String,
    http: Arc<HttpClient>,
    downloads_dir: PathBuf,
}

impl ApiSource {
    pub fn new(
        query: impl Into<String>,
        base_url: impl Into<String>,
        http: Arc<HttpClient>,
        downloads_dir: PathBuf,
    ) -> Self {
        Self {
            query: sanitize_query(&query.into()),
            base_url: base_url.into(),
            http,
            downloads_dir,
        }
    }

    /// Whether a URL belongs to one of the API-served platforms.
    #[must_use]
    pub fn matches_url(url: &str) -> bool {
        SPOTIFY_PATTERN.is_match(url)
            || APPLE_MUSIC_PATTERN.is_match(url)
            || SOUNDCLOUD_PATTERN.is_match(url)
            || MUSIC_SUBHOST_PATTERN.is_match(url)
    }

    fn endpoint(&self, path: &str, param: &str, value: &str) -> String {
        format!(
            "{}/{}?{}={}",
            self.base_url,
            path,
            param,
            urlencode(value)
        )
    }

    fn parse_tracks(list: ApiTrackList) -> Result<Vec<Track>> {
        let tracks: Vec<Track> = list
            .results
            .into_iter()
            .filter(|t| !t.id.is_empty())
            .map(|t| Track {
                id: t.id,
                platform: t.platform.parse().unwrap_or(Platform::Spotify),
                url: t.url,
                title: t.name,
                duration_secs: t.duration,
                cover_url: (!t.cover.is_empty()).then_some(t.cover),
                cdn_url: None,
                decrypt_key: None,
                lyrics: None,
            })
            .collect();

        if tracks.is_empty() {
            return Err(Error::Resolution("Catalog returned no tracks".to_string()));
        }
        Ok(tracks)
    }
}

#[async_trait]
impl MediaSource for ApiSource {
    fn is_valid(&self) -> bool {
        Self::matches_url(&self.query)
    }

    async fn get_info(&self) -> Result<Vec<Track>> {
        if !self.is_valid() {
            return Err(Error::InvalidInput(format!(
                "Unsupported catalog URL: {}",
                self.query
            )));
        }
        let url = self.endpoint("get_url", "url", &self.query);
        let list: ApiTrackList = self.http.get_json(&url).await?;
        Self::parse_tracks(list)
    }

    async fn search(&self) -> Result<Vec<Track>> {
        if self.query.is_empty() {
            return Err(Error::InvalidInput("No search query provided".to_string()));
        }
        if self.is_valid() {
            return self.get_info().await;
        }
        let url = format!(
            "{}/search?query={}&limit=5",
            self.base_url,
            urlencode(&self.query)
        );
        let list: ApiTrackList = self.http.get_json(&url).await?;
        Self::parse_tracks(list)
    }

    async fn get_track(&self) -> Result<Track> {
        if self.query.is_empty() {
            return Err(Error::InvalidInput("No track identifier provided".to_string()));
        }
        let url = self.endpoint("track", "url", &self.query);
        let info: ApiTrackInfo = self.http.get_json(&url).await?;

        Ok(Track {
            id: info.tc,
            platform: info.platform.parse().unwrap_or(Platform::Spotify),
            url: info.url,
            title: info.name,
            duration_secs: info.duration,
            cover_url: (!info.cover.is_empty()).then_some(info.cover),
            cdn_url: (!info.cdnurl.is_empty()).then_some(info.cdnurl),
            decrypt_key: (!info.key.is_empty() && info.key != "None").then_some(info.key),
            lyrics: info.lyrics,
        })
    }

    async fn download(&self, track: &Track, _is_video: bool) -> Result<PathBuf> {
        let Some(cdn_url) = &track.cdn_url else {
            return Err(Error::Materialization(format!(
                "No byte source for track {}",
                track.id
            )));
        };

        if track.platform == Platform::Spotify {
            let key = track.decrypt_key.as_deref().ok_or_else(|| {
                Error::Materialization(format!("Missing decrypt key for track {}", track.id))
            })?;

            let output = self.downloads_dir.join(format!("{}.ogg", track.id));
            if output.exists() {
                return Ok(output);
            }
            let encrypted = self.downloads_dir.join(format!("{}.encrypted.ogg", track.id));
            self.http.download_file(cdn_url, &encrypted).await?;
            return crypto::process_encrypted_download(&encrypted, &output, key).await;
        }

        let dest = self.downloads_dir.join(format!("{}.mp3", track.id));
        self.http.download_file(cdn_url, &dest).await
    }
}

/// Strip the fragment off a pasted URL. Query strings stay: the music
/// sub-host keeps its id there, and the catalog canonicalizes the rest.
fn sanitize_query(query: &str) -> String {
    query
        .trim()
        .split('#')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
