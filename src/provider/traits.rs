//! Media source interface.
//!
//! Every catalog backend implements [`MediaSource`]; the resolver picks one
//! per input and delegates. Deadlines are enforced by the resolver, not the
//! backends.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::models::Track;
use crate::Result;

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Whether the query is a URL this backend owns.
    fn is_valid(&self) -> bool;

    /// Metadata for a track, album or playlist URL: one or many tracks.
    async fn get_info(&self) -> Result<Vec<Track>>;

    /// Free-text search. Falls back to [`get_info`](Self::get_info) when
    /// the query is a valid URL for the backend.
    async fn search(&self) -> Result<Vec<Track>>;

    /// One track with a resolvable byte source.
    async fn get_track(&self) -> Result<Track>;

    /// Materialize the media on disk and return its path.
    async fn download(&self, track: &Track, is_video: bool) -> Result<PathBuf>;
}
