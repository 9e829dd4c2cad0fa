//! HTTP client for catalog calls and media downloads.
//!
//! Retries live here and nowhere else: JSON GETs make up to two attempts
//! with exponential backoff starting at one second, retrying only transport
//! errors and 5xx responses. Downloads stream into a `.part` temp file that
//! is renamed onto the destination on success.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

const MAX_ATTEMPTS: u32 = 2;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// Catalog base URL; requests under it carry the API key header.
    api_base: Option<String>,
    api_key: String,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl HttpClient {
    /// `connect_timeout` bounds connection establishment only; overall
    /// deadlines are the caller's (the resolver wraps every operation).
    pub fn new(
        api_base: Option<String>,
        api_key: String,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.map(|b| b.trim_end_matches('/').to_string()),
            api_key,
        })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(base) = &self.api_base {
            if url.starts_with(base.as_str()) {
                req = req.header("X-API-Key", self.api_key.as_str());
            }
        }
        req
    }

    /// GET a JSON document with retries.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }

            match self.request(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        tracing::warn!(
                            url,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            "Catalog request failed, retrying"
                        );
                        last_error = Some(Error::Network(format!(
                            "{url} returned {status}: {body}"
                        )));
                        continue;
                    }
                    // Non-5xx failure is terminal.
                    return Err(Error::Resolution(format!("{url} returned {status}: {body}")));
                }
                Err(e) if e.is_timeout() => return Err(Error::Deadline(e.to_string())),
                Err(e) => {
                    tracing::warn!(url, attempt = attempt + 1, error = %e, "Request failed, retrying");
                    last_error = Some(Error::Network(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Network(format!("All retries failed for {url}"))))
    }

    /// GET a page body as text (used by the scrape fallback). No retries
    /// beyond the transport layer's own.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.request(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("{url} returned {status}")));
        }
        Ok(response.text().await?)
    }

    /// Stream a file to `dest`, atomically: bytes land in `<dest>.part`
    /// which is renamed on success and removed on failure.
    pub async fn download_file(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        if url.is_empty() {
            return Err(Error::InvalidInput("Empty download URL".to_string()));
        }

        if dest.exists() {
            tracing::debug!(path = %dest.display(), "File already downloaded");
            return Ok(dest.to_path_buf());
        }

        let response = self.request(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Materialization(format!(
                "Download of {url} returned {status}"
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = part_path(dest);
        let result = async {
            let mut file = tokio::fs::File::create(&part).await?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        tokio::fs::rename(&part, dest).await?;
        tracing::info!(url, path = %dest.display(), "Downloaded file");
        Ok(dest.to_path_buf())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_appends_suffix() {
        let dest = Path::new("/tmp/music/abc.mp3");
        assert_eq!(part_path(dest), Path::new("/tmp/music/abc.mp3.part"));
    }

    #[test]
    fn test_api_key_only_for_catalog_urls() {
        let client = HttpClient::new(
            Some("https://catalog.example.com/".to_string()),
            "secret".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();

        let catalog = client
            .request("https://catalog.example.com/track?url=x")
            .build()
            .unwrap();
        assert!(catalog.headers().contains_key("X-API-Key"));

        let other = client
            .request("https://other.example.com/page")
            .build()
            .unwrap();
        assert!(!other.headers().contains_key("X-API-Key"));
    }
}
