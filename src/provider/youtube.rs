//! Video-site backend.
//!
//! Metadata comes from the site's oEmbed endpoint when possible and from a
//! results-page scrape otherwise (search, playlists). Downloads try the
//! catalog API first, which is usually faster, and fall back to the
//! external downloader tool run as a subprocess.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::prelude::IndexedRandom;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use super::http::HttpClient;
use super::traits::MediaSource;
use crate::models::{Platform, Track};
use crate::{Error, Result};

static VIDEO_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:https?://)?(?:www\.|m\.)?(?:youtube\.com|youtu\.be)/(?:watch\?v=|embed/|v/|shorts/)?([\w-]{11})(?:\?|&|$)",
    )
    .expect("static regex")
});

static PLAYLIST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.|m\.)?youtube\.com/(?:playlist|watch)\?.*\blist=([\w-]+)")
        .expect("static regex")
});

static SHORTS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.|m\.)?youtube\.com/shorts/([\w-]+)")
        .expect("static regex")
});

/// Most results returned for a free-text search.
const SEARCH_LIMIT: usize = 5;

#[derive(Debug, Deserialize)]
struct OembedResponse {
    title: String,
    #[serde(default)]
    thumbnail_url: Option<String>,
}

/// Catalog API's `/track` shape, reused for the download fast path.
#[derive(Debug, Deserialize)]
struct ApiTrackInfo {
    #[serde(default)]
    cdnurl: String,
    tc: String,
}

pub struct YoutubeSource {
    query: String,
    http: Arc<HttpClient>,
    api_base: Option<String>,
    downloads_dir: PathBuf,
    cookies_dir: PathBuf,
    proxy: Option<String>,
    download_timeout: Duration,
}

pub struct YoutubeConfig {
    pub api_base: Option<String>,
    pub downloads_dir: PathBuf,
    pub cookies_dir: PathBuf,
    pub proxy: Option<String>,
    pub download_timeout: Duration,
}

impl YoutubeSource {
    pub fn new(query: impl Into<String>, http: Arc<HttpClient>, config: YoutubeConfig) -> Self {
        Self {
            query: clean_query(&query.into()),
            http,
            api_base: config.api_base,
            downloads_dir: config.downloads_dir,
            cookies_dir: config.cookies_dir,
            proxy: config.proxy,
            download_timeout: config.download_timeout,
        }
    }

    /// Whether a URL belongs to the video site (watch/short/mobile/embed).
    /// The music sub-host is deliberately excluded; the catalog API owns it.
    #[must_use]
    pub fn matches_url(url: &str) -> bool {
        if url.to_lowercase().contains("music.youtube.com") {
            return false;
        }
        VIDEO_PATTERN.is_match(url) || PLAYLIST_PATTERN.is_match(url) || SHORTS_PATTERN.is_match(url)
    }

    fn extract_video_id(url: &str) -> Option<String> {
        VIDEO_PATTERN
            .captures(url)
            .or_else(|| SHORTS_PATTERN.captures(url))
            .map(|c| c[1].to_string())
    }

    async fn video_info(&self, url: &str) -> Result<Track> {
        let normalized = normalize_url(url)
            .ok_or_else(|| Error::InvalidInput(format!("Unrecognized video URL: {url}")))?;
        let id = Self::extract_video_id(&normalized)
            .ok_or_else(|| Error::InvalidInput(format!("No video id in URL: {url}")))?;

        let oembed_url = format!(
            "https://www.youtube.com/oembed?url={normalized}&format=json"
        );
        match self.http.get_json::<OembedResponse>(&oembed_url).await {
            Ok(data) => Ok(make_track(&id, data.title, 0, data.thumbnail_url)),
            Err(e) => {
                tracing::debug!(url = %normalized, error = %e, "oEmbed lookup failed, scraping");
                let mut results = self.scrape_search(&normalized, 1).await?;
                results
                    .pop()
                    .ok_or_else(|| Error::Resolution(format!("No metadata for video {id}")))
            }
        }
    }

    async fn playlist_info(&self, url: &str) -> Result<Vec<Track>> {
        let page = self.http.get_text(url).await?;
        let tracks = scrape_initial_data(&page, usize::MAX)?;
        if tracks.is_empty() {
            return Err(Error::Resolution("Playlist has no playable entries".to_string()));
        }
        Ok(tracks)
    }

    async fn scrape_search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
        let url = format!(
            "https://www.youtube.com/results?search_query={}",
            query.replace(' ', "+")
        );
        let page = self.http.get_text(&url).await?;
        scrape_initial_data(&page, limit)
    }

    /// Try the catalog API's resolver before shelling out to the
    /// downloader; the API answers from cache in most cases.
    async fn download_with_api(&self, video_id: &str, is_video: bool) -> Option<PathBuf> {
        let base = self.api_base.as_deref()?;
        let url = format!(
            "{base}/track?url=https://www.youtube.com/watch?v={video_id}&video={is_video}"
        );
        let info = match self.http.get_json::<ApiTrackInfo>(&url).await {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(video_id, error = %e, "API download path unavailable");
                return None;
            }
        };
        if info.cdnurl.is_empty() {
            return None;
        }

        let ext = if is_video { "mp4" } else { "m4a" };
        let dest = self.downloads_dir.join(format!("{}.{ext}", info.tc));
        match self.http.download_file(&info.cdnurl, &dest).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(video_id, error = %e, "CDN download failed, falling back");
                None
            }
        }
    }

    /// Pick a random cookie file for the downloader, rotating per call.
    fn pick_cookie_file(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.cookies_dir).ok()?;
        let files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        files.choose(&mut rand::rng()).cloned()
    }

    fn ytdlp_args(&self, video_id: &str, is_video: bool, cookie_file: Option<&Path>) -> Vec<String> {
        let output_template = self
            .downloads_dir
            .join("%(id)s.%(ext)s")
            .to_string_lossy()
            .into_owned();

        let format_selector = if is_video {
            "bestvideo[ext=mp4][height<=1080]+bestaudio[ext=m4a]/best[ext=mp4][height<=1080]"
        } else {
            "bestaudio[ext=m4a]/bestaudio[ext=mp4]/bestaudio[ext=webm]/bestaudio/best"
        };

        let mut args: Vec<String> = [
            "--no-warnings",
            "--quiet",
            "--geo-bypass",
            "--retries",
            "2",
            "--continue",
            "--no-part",
            "--concurrent-fragments",
            "3",
            "--socket-timeout",
            "10",
            "--retry-sleep",
            "1",
            "--no-write-thumbnail",
            "--no-write-info-json",
            "--no-embed-metadata",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        args.push("-o".to_string());
        args.push(output_template);
        args.push("-f".to_string());
        args.push(format_selector.to_string());

        if is_video {
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }

        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        } else if let Some(cookie_file) = cookie_file {
            args.push("--cookies".to_string());
            args.push(cookie_file.to_string_lossy().into_owned());
        }

        args.push(format!("https://www.youtube.com/watch?v={video_id}"));
        args.push("--print".to_string());
        args.push("after_move:filepath".to_string());

        args
    }

    async fn download_with_ytdlp(&self, video_id: &str, is_video: bool) -> Result<PathBuf> {
        let cookie_file = self.pick_cookie_file();
        let args = self.ytdlp_args(video_id, is_video, cookie_file.as_deref());

        tracing::debug!(video_id, is_video, "Starting yt-dlp download");
        let mut child = tokio::process::Command::new("yt-dlp")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Materialization(format!("Failed to spawn yt-dlp: {e}")))?;

        let output = match tokio::time::timeout(self.download_timeout, child.wait_with_output())
            .await
        {
            Ok(output) => {
                output.map_err(|e| Error::Materialization(format!("yt-dlp failed: {e}")))?
            }
            // kill_on_drop reaps the child when the future is dropped here.
            Err(_) => {
                return Err(Error::Deadline(format!(
                    "yt-dlp timed out for video {video_id}"
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Materialization(format!(
                "yt-dlp exited with {} for {video_id}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path_str.is_empty() {
            return Err(Error::Materialization(format!(
                "yt-dlp reported no output path for {video_id}"
            )));
        }

        let path = PathBuf::from(path_str);
        if !path.exists() {
            return Err(Error::Materialization(format!(
                "yt-dlp output missing on disk: {}",
                path.display()
            )));
        }

        tracing::info!(video_id, path = %path.display(), "Downloaded via yt-dlp");
        Ok(path)
    }
}

#[async_trait]
impl MediaSource for YoutubeSource {
    fn is_valid(&self) -> bool {
        Self::matches_url(&self.query)
    }

    async fn get_info(&self) -> Result<Vec<Track>> {
        if !self.is_valid() {
            return Err(Error::InvalidInput(format!(
                "Not a video-site URL: {}",
                self.query
            )));
        }
        if PLAYLIST_PATTERN.is_match(&self.query) {
            self.playlist_info(&self.query).await
        } else {
            Ok(vec![self.video_info(&self.query).await?])
        }
    }

    async fn search(&self) -> Result<Vec<Track>> {
        if self.query.is_empty() {
            return Err(Error::InvalidInput("No search query provided".to_string()));
        }
        if self.is_valid() {
            return self.get_info().await;
        }

        let results = self.scrape_search(&self.query, SEARCH_LIMIT).await?;
        if results.is_empty() {
            return Err(Error::Resolution(format!(
                "No results found for: {}",
                self.query
            )));
        }
        Ok(results)
    }

    async fn get_track(&self) -> Result<Track> {
        let url = if self.query.starts_with("http") {
            self.query.clone()
        } else {
            format!("https://www.youtube.com/watch?v={}", self.query)
        };
        self.video_info(&url).await
    }

    async fn download(&self, track: &Track, is_video: bool) -> Result<PathBuf> {
        if let Some(path) = self.download_with_api(&track.id, is_video).await {
            return Ok(path);
        }
        self.download_with_ytdlp(&track.id, is_video).await
    }
}

/// Drop extra query parameters and fragments, keeping the first.
fn clean_query(query: &str) -> String {
    query
        .trim()
        .split(['&', '#'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Normalize short-link and shorts forms to the canonical watch URL.
fn normalize_url(url: &str) -> Option<String> {
    if let Some(rest) = url.split("youtu.be/").nth(1) {
        let id = rest.split(['?', '#']).next()?;
        return Some(format!("https://www.youtube.com/watch?v={id}"));
    }
    if let Some(rest) = url.split("youtube.com/shorts/").nth(1) {
        let id = rest.split(['?', '#']).next()?;
        return Some(format!("https://www.youtube.com/watch?v={id}"));
    }
    Some(url.to_string())
}

fn make_track(id: &str, title: String, duration_secs: u32, cover: Option<String>) -> Track {
    Track {
        id: id.to_string(),
        platform: Platform::Youtube,
        url: format!("https://www.youtube.com/watch?v={id}"),
        title,
        duration_secs,
        cover_url: cover,
        cdn_url: None,
        decrypt_key: None,
        lyrics: None,
    }
}

/// Pull video entries out of a results or playlist page.
///
/// Pages embed a `ytInitialData` JSON blob; rather than model its deeply
/// nested renderer tree, walk the parsed value for `videoRenderer` /
/// `playlistVideoRenderer` objects and read the few fields we need.
fn scrape_initial_data(page: &str, limit: usize) -> Result<Vec<Track>> {
    static INITIAL_DATA: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)var ytInitialData\s*=\s*(\{.*?\});</script>").expect("static regex"));

    let json_str = INITIAL_DATA
        .captures(page)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::Resolution("No embedded metadata in page".to_string()))?;

    let data: serde_json::Value = serde_json::from_str(&json_str)
        .map_err(|e| Error::Resolution(format!("Malformed embedded metadata: {e}")))?;

    let mut tracks = Vec::new();
    collect_video_renderers(&data, &mut tracks, limit);
    Ok(tracks)
}

fn collect_video_renderers(value: &serde_json::Value, out: &mut Vec<Track>, limit: usize) {
    if out.len() >= limit {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                if key == "videoRenderer" || key == "playlistVideoRenderer" {
                    if let Some(track) = parse_video_renderer(child) {
                        out.push(track);
                        if out.len() >= limit {
                            return;
                        }
                    }
                } else {
                    collect_video_renderers(child, out, limit);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_video_renderers(item, out, limit);
                if out.len() >= limit {
                    return;
                }
            }
        }
        _ => {}
    }
}

fn parse_video_renderer(renderer: &serde_json::Value) -> Option<Track> {
    let id = renderer.get("videoId")?.as_str()?;

    let title = renderer
        .get("title")
        .and_then(|t| {
            t.pointer("/runs/0/text")
                .or_else(|| t.pointer("/simpleText"))
        })
        .and_then(|t| t.as_str())
        .unwrap_or("Unknown title");

    let duration = renderer
        .pointer("/lengthText/simpleText")
        .and_then(|d| d.as_str())
        .map(duration_to_seconds)
        .unwrap_or(0);

    let cover = renderer
        .pointer("/thumbnail/thumbnails")
        .and_then(|t| t.as_array())
        .and_then(|thumbs| thumbs.last())
        .and_then(|t| t.get("url"))
        .and_then(|u| u.as_str())
        .map(String::from);

    Some(make_track(id, title.to_string(), duration, cover))
}

/// Convert "HH:MM:SS" or "MM:SS" to seconds.
fn duration_to_seconds(duration: &str) -> u32 {
    let parts: Vec<u32> = duration
        .split(':')
        .filter_map(|p| p.parse().ok())
        .collect();
    match parts.as_slice() {
        [h, m, s] => h * 3600 + m * 60 + s,
        [m, s] => m * 60 + s,
        [s] => *s,
        _ => 0,
    }
}
