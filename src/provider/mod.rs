//! Media-source resolution layer.
//!
//! Turns a play request's input (a URL, free text, or an in-platform
//! attachment) into [`Track`]s and, later, into a local transcoded file.
//! [`SourceResolver`] classifies the input (first pattern match wins),
//! delegates to the owning backend, and enforces the caller deadlines:
//! metadata calls and downloads each get their configured allowance, and
//! expiry cancels in-flight HTTP and subprocess work.

pub mod api;
pub mod attachment;
pub mod crypto;
pub mod http;
pub mod traits;
pub mod youtube;

pub use api::ApiSource;
pub use attachment::AttachmentSource;
pub use http::HttpClient;
pub use traits::MediaSource;
pub use youtube::{YoutubeConfig, YoutubeSource};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::gateway::{AttachmentRef, ChatGateway};
use crate::models::Track;
use crate::{Error, Result};

/// One play request's input, as parsed from the message entities.
/// Unknown entity kinds are not modeled; the handler maps them to `Text`.
#[derive(Debug, Clone)]
pub enum PlayInput {
    /// The visible message text: a URL or a free-text query.
    Text(String),
    /// A URL carried by an inline entity rather than the visible text.
    Link(String),
    /// A media message replied to or forwarded directly.
    Attachment(AttachmentRef),
}

/// Shared dependencies for building resolvers, assembled once at startup.
pub struct SourceDeps {
    pub http: Arc<HttpClient>,
    pub gateway: Arc<dyn ChatGateway>,
    pub api_base: Option<String>,
    pub default_service: String,
    pub downloads_dir: PathBuf,
    pub cookies_dir: PathBuf,
    pub proxy: Option<String>,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub max_file_size: u64,
}

impl SourceDeps {
    pub fn from_config(config: &Config, gateway: Arc<dyn ChatGateway>) -> Result<Self> {
        let api_base = config
            .api
            .is_configured()
            .then(|| config.api.base_url().to_string());
        let http = Arc::new(HttpClient::new(
            api_base.clone(),
            config.api.key.clone(),
            Duration::from_secs(10),
        )?);

        Ok(Self {
            http,
            gateway,
            api_base,
            default_service: config.api.default_service.clone(),
            downloads_dir: config.downloads.dir.clone(),
            cookies_dir: config.downloads.cookies_dir.clone(),
            proxy: config.downloads.proxy.clone(),
            metadata_timeout: Duration::from_secs(config.limits.metadata_timeout_seconds),
            download_timeout: Duration::from_secs(config.limits.download_timeout_seconds),
            max_file_size: config.downloads.max_file_size_bytes,
        })
    }
}

/// Which backend a query classified to. Exposed for tests and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Youtube,
    Api,
    Attachment,
}

/// Hands out a [`SourceResolver`] per play input. [`SourceDeps`] is the
/// production implementation; tests inject a factory that resolves from
/// fixtures.
pub trait SourceFactory: Send + Sync {
    fn resolver(&self, input: &PlayInput) -> SourceResolver;

    fn resolver_for_query(&self, query: &str) -> SourceResolver;
}

impl SourceFactory for SourceDeps {
    fn resolver(&self, input: &PlayInput) -> SourceResolver {
        SourceResolver::for_input(self, input)
    }

    fn resolver_for_query(&self, query: &str) -> SourceResolver {
        SourceResolver::for_query(self, query)
    }
}

/// Facade over the backends: picks one per input at construction and
/// delegates, with deadlines applied around every suspension.
pub struct SourceResolver {
    backend: Box<dyn MediaSource>,
    kind: BackendKind,
    metadata_timeout: Duration,
    download_timeout: Duration,
}

impl SourceResolver {
    /// Wrap an already-chosen backend. The classifying constructors below
    /// are the production path; this one serves tests and embedders.
    #[must_use]
    pub fn with_backend(
        backend: Box<dyn MediaSource>,
        kind: BackendKind,
        metadata_timeout: Duration,
        download_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            kind,
            metadata_timeout,
            download_timeout,
        }
    }

    pub fn for_input(deps: &SourceDeps, input: &PlayInput) -> Self {
        match input {
            PlayInput::Text(query) | PlayInput::Link(query) => Self::for_query(deps, query),
            PlayInput::Attachment(attachment) => Self {
                backend: Box::new(AttachmentSource::from_ref(
                    attachment.clone(),
                    deps.gateway.clone(),
                    deps.downloads_dir.clone(),
                    deps.max_file_size,
                )),
                kind: BackendKind::Attachment,
                metadata_timeout: deps.metadata_timeout,
                download_timeout: deps.download_timeout,
            },
        }
    }

    /// Classify a textual query. First match wins; free text falls through
    /// to the configured default backend.
    pub fn for_query(deps: &SourceDeps, query: &str) -> Self {
        let kind = Self::classify(deps, query);
        let backend: Box<dyn MediaSource> = match kind {
            BackendKind::Youtube => Box::new(YoutubeSource::new(
                query,
                deps.http.clone(),
                YoutubeConfig {
                    api_base: deps.api_base.clone(),
                    downloads_dir: deps.downloads_dir.clone(),
                    cookies_dir: deps.cookies_dir.clone(),
                    proxy: deps.proxy.clone(),
                    download_timeout: deps.download_timeout,
                },
            )),
            BackendKind::Api => Box::new(ApiSource::new(
                query,
                deps.api_base.clone().unwrap_or_default(),
                deps.http.clone(),
                deps.downloads_dir.clone(),
            )),
            BackendKind::Attachment => Box::new(AttachmentSource::new(
                query,
                deps.gateway.clone(),
                deps.downloads_dir.clone(),
                deps.max_file_size,
            )),
        };

        Self {
            backend,
            kind,
            metadata_timeout: deps.metadata_timeout,
            download_timeout: deps.download_timeout,
        }
    }

    fn classify(deps: &SourceDeps, query: &str) -> BackendKind {
        if YoutubeSource::matches_url(query) {
            return BackendKind::Youtube;
        }
        if deps.api_base.is_some() && ApiSource::matches_url(query) {
            return BackendKind::Api;
        }
        if AttachmentSource::matches_url(query) {
            return BackendKind::Attachment;
        }
        // Free text: search against the default backend.
        if deps.default_service.eq_ignore_ascii_case("api") && deps.api_base.is_some() {
            BackendKind::Api
        } else {
            BackendKind::Youtube
        }
    }

    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.backend.is_valid()
    }

    pub async fn get_info(&self) -> Result<Vec<Track>> {
        with_deadline(self.metadata_timeout, "metadata", self.backend.get_info()).await
    }

    pub async fn search(&self) -> Result<Vec<Track>> {
        with_deadline(self.metadata_timeout, "search", self.backend.search()).await
    }

    pub async fn get_track(&self) -> Result<Track> {
        with_deadline(self.metadata_timeout, "track lookup", self.backend.get_track()).await
    }

    /// Materialize a track on disk. The deadline covers the whole
    /// pipeline; on expiry in-flight subprocesses die with their future.
    pub async fn download(&self, track: &Track, is_video: bool) -> Result<PathBuf> {
        match tokio::time::timeout(self.download_timeout, self.backend.download(track, is_video))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Deadline(format!("timed out for video {}", track.id))),
        }
    }

    /// Resolve the tracks for a play request: URL inputs resolve info,
    /// free text searches.
    pub async fn resolve(&self) -> Result<Vec<Track>> {
        if self.is_valid() {
            self.get_info().await
        } else {
            self.search().await
        }
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Deadline(format!(
            "{what} exceeded {}s",
            deadline.as_secs()
        ))),
    }
}

/// Probe a media file's duration with `ffprobe`, for tracks whose catalog
/// did not report one.
pub async fn probe_duration(path: &Path) -> Option<u32> {
    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        tracing::debug!(path = %path.display(), "ffprobe failed");
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .map(|secs| secs.round() as u32)
}
