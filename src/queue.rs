//! Per-chat queue store: ordered track queue, loop counter, active flag.
//!
//! Each chat's state lives under one `DashMap` entry, so head advancement
//! and the active flag always change together under the shard lock; no
//! reader can observe an active chat with an empty queue.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::models::{ChatId, Platform, QueuedTrack};
use crate::{Error, Result};

/// Hard cap on queued tracks per chat; the admission-side backpressure.
pub const MAX_QUEUE_LEN: usize = 10;

/// Most replays a head track can be set to loop.
pub const MAX_LOOP: u8 = 10;

#[derive(Debug, Default)]
struct ChatState {
    active: bool,
    queue: VecDeque<QueuedTrack>,
}

/// In-memory queue store, one entry per chat that has ever played.
#[derive(Debug, Default)]
pub struct ChatQueueStore {
    chats: DashMap<ChatId, ChatState>,
}

impl ChatQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track; returns its 1-based queue position.
    ///
    /// Rejects the append once the queue holds [`MAX_QUEUE_LEN`] tracks.
    /// Does not start playback and does not touch the active flag.
    pub fn add(&self, chat: ChatId, track: QueuedTrack) -> Result<usize> {
        let mut state = self.chats.entry(chat).or_default();
        if state.queue.len() >= MAX_QUEUE_LEN {
            return Err(Error::QueueFull {
                len: state.queue.len(),
            });
        }
        state.queue.push_back(track);
        Ok(state.queue.len())
    }

    /// The currently playing track (head), if any.
    #[must_use]
    pub fn playing(&self, chat: ChatId) -> Option<QueuedTrack> {
        self.chats
            .get(&chat)
            .and_then(|state| state.queue.front().cloned())
    }

    /// The next track after the head (peek; does not pop).
    #[must_use]
    pub fn upcoming(&self, chat: ChatId) -> Option<QueuedTrack> {
        self.chats
            .get(&chat)
            .and_then(|state| state.queue.get(1).cloned())
    }

    /// Remove and return the head. With `release_file`, unlinks the
    /// materialized file the entry owned. Flips the chat inactive in the
    /// same critical section when this was the last entry.
    pub fn pop_head(&self, chat: ChatId, release_file: bool) -> Option<QueuedTrack> {
        let mut state = self.chats.get_mut(&chat)?;
        let removed = state.queue.pop_front()?;
        if state.queue.is_empty() {
            state.active = false;
        }
        drop(state);

        if release_file {
            if let Some(path) = &removed.local_path {
                remove_media_file(path);
            }
        }
        Some(removed)
    }

    /// Remove a non-head entry by its 1-based queue position.
    ///
    /// The head (index 1) is owned by the coordinator's advance path and
    /// cannot be removed here.
    pub fn remove_at(&self, chat: ChatId, index: usize) -> Result<QueuedTrack> {
        if index <= 1 {
            return Err(Error::InvalidInput(
                "The playing track cannot be removed; use skip".to_string(),
            ));
        }
        let mut state = self
            .chats
            .get_mut(&chat)
            .ok_or_else(|| Error::InvalidInput("Nothing is queued here".to_string()))?;
        if index > state.queue.len() {
            return Err(Error::InvalidInput(format!(
                "No track at position {index} (queue has {})",
                state.queue.len()
            )));
        }
        let removed = state.queue.remove(index - 1).expect("index checked above");
        drop(state);

        if let Some(path) = &removed.local_path {
            remove_media_file(path);
        }
        Ok(removed)
    }

    /// Set the head track's remaining replays, `0..=`[`MAX_LOOP`].
    /// Out-of-range values are rejected without touching state.
    pub fn set_loop(&self, chat: ChatId, count: u8) -> Result<()> {
        if count > MAX_LOOP {
            return Err(Error::InvalidInput(format!(
                "Loop count must be between 0 and {MAX_LOOP}"
            )));
        }
        let mut state = self
            .chats
            .get_mut(&chat)
            .ok_or_else(|| Error::InvalidInput("Nothing is playing here".to_string()))?;
        match state.queue.front_mut() {
            Some(head) => {
                head.loop_remaining = count;
                Ok(())
            }
            None => Err(Error::InvalidInput("Nothing is playing here".to_string())),
        }
    }

    #[must_use]
    pub fn loop_count(&self, chat: ChatId) -> u8 {
        self.chats
            .get(&chat)
            .and_then(|state| state.queue.front().map(|t| t.loop_remaining))
            .unwrap_or(0)
    }

    /// Decrement the head's loop counter, returning the new value.
    pub fn decrement_loop(&self, chat: ChatId) -> u8 {
        self.chats
            .get_mut(&chat)
            .and_then(|mut state| {
                state.queue.front_mut().map(|head| {
                    head.loop_remaining = head.loop_remaining.saturating_sub(1);
                    head.loop_remaining
                })
            })
            .unwrap_or(0)
    }

    /// Record the materialized file path on the head entry.
    pub fn set_head_path(&self, chat: ChatId, path: PathBuf) {
        if let Some(mut state) = self.chats.get_mut(&chat) {
            if let Some(head) = state.queue.front_mut() {
                head.local_path = Some(path);
            }
        }
    }

    /// Backfill a probed duration on the head entry.
    pub fn set_head_duration(&self, chat: ChatId, duration_secs: u32) {
        if let Some(mut state) = self.chats.get_mut(&chat) {
            if let Some(head) = state.queue.front_mut() {
                head.track.duration_secs = duration_secs;
            }
        }
    }

    #[must_use]
    pub fn is_active(&self, chat: ChatId) -> bool {
        self.chats.get(&chat).is_some_and(|state| state.active)
    }

    pub fn set_active(&self, chat: ChatId, active: bool) {
        let mut state = self.chats.entry(chat).or_default();
        state.active = active;
    }

    /// Drop everything known about the chat, unlinking owned files when
    /// `release_files` is set.
    pub fn clear(&self, chat: ChatId, release_files: bool) {
        if let Some((_, state)) = self.chats.remove(&chat) {
            if release_files {
                for track in &state.queue {
                    if let Some(path) = &track.local_path {
                        remove_media_file(path);
                    }
                }
            }
        }
    }

    /// Find a queued track by its dedupe key.
    #[must_use]
    pub fn find_by_track_id(&self, chat: ChatId, platform: Platform, id: &str) -> Option<QueuedTrack> {
        self.chats.get(&chat).and_then(|state| {
            state
                .queue
                .iter()
                .find(|t| t.track.platform == platform && t.track.id == id)
                .cloned()
        })
    }

    #[must_use]
    pub fn queue_len(&self, chat: ChatId) -> usize {
        self.chats.get(&chat).map_or(0, |state| state.queue.len())
    }

    /// Read-side copy of the whole queue for status views.
    #[must_use]
    pub fn snapshot(&self, chat: ChatId) -> Vec<QueuedTrack> {
        self.chats
            .get(&chat)
            .map(|state| state.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active_chats(&self) -> Vec<ChatId> {
        self.chats
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| *entry.key())
            .collect()
    }
}

fn remove_media_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove media file");
        }
    }
}
