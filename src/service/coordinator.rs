//! Playback coordinator.
//!
//! The top-level per-chat state machine: admission → queue → resolution →
//! assistant → materialization → engine, and the advance loop driven by
//! stream-end events. All state-mutating operations on one chat are
//! serialized behind a per-chat lock; engine callbacks arrive over a
//! channel and are handled on a coordinator task, never on engine threads.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::engine::{CallRouter, DescriptorParams, EngineEvent, EngineEventReceiver, StreamKind};
use crate::models::{ChatId, Platform, QueuedTrack, Track, UserId};
use crate::provider::{self, PlayInput, SourceFactory};
use crate::queue::{ChatQueueStore, MAX_QUEUE_LEN};
use crate::service::admission::AdmissionService;
use crate::service::assistant::AssistantPool;
use crate::service::notifier::Notifier;
use crate::{Error, Result};

/// A play request as the command surface hands it over.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub chat: ChatId,
    pub user: UserId,
    /// Display name for "requested by" lines.
    pub requester: String,
    pub input: PlayInput,
    pub is_video: bool,
}

/// What an enqueue did, for the command surface to render.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    /// Track that started playing right away (chat was idle).
    pub started: Option<Track>,
    /// Tracks appended behind the current one, with their positions.
    pub queued: Vec<(usize, Track)>,
    /// Tracks already in the queue; surfaced, never silently dropped.
    pub duplicates: Vec<Track>,
}

/// Read-side view of a chat's queue.
#[derive(Debug, Clone)]
pub struct QueueView {
    pub now: Option<QueuedTrack>,
    pub upcoming: Vec<QueuedTrack>,
    pub total: usize,
}

pub struct PlaybackCoordinator {
    queue: Arc<ChatQueueStore>,
    admission: Arc<AdmissionService>,
    assistants: Arc<AssistantPool>,
    calls: Arc<CallRouter>,
    sources: Arc<dyn SourceFactory>,
    notifier: Arc<dyn Notifier>,
    chat_locks: DashMap<ChatId, Arc<Mutex<()>>>,
    /// Played to direct callers who ring the assistant.
    call_notice: Option<PathBuf>,
}

impl std::fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCoordinator").finish()
    }
}

impl PlaybackCoordinator {
    #[must_use]
    pub fn new(
        queue: Arc<ChatQueueStore>,
        admission: Arc<AdmissionService>,
        assistants: Arc<AssistantPool>,
        calls: Arc<CallRouter>,
        sources: Arc<dyn SourceFactory>,
        notifier: Arc<dyn Notifier>,
        call_notice: Option<PathBuf>,
    ) -> Self {
        Self {
            queue,
            admission,
            assistants,
            calls,
            sources,
            notifier,
            chat_locks: DashMap::new(),
            call_notice,
        }
    }

    fn chat_lock(&self, chat: ChatId) -> Arc<Mutex<()>> {
        self.chat_locks.entry(chat).or_default().clone()
    }

    /// Handle a play command end to end.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        let chat = request.chat;

        self.admission.ensure_bot_privileges(chat).await?;
        if !self.admission.can_play(chat, request.user).await? {
            return Err(Error::Admission(
                "You are not allowed to play media in this chat".to_string(),
            ));
        }

        let lock = self.chat_lock(chat);
        let _guard = lock.lock().await;

        let len = self.queue.queue_len(chat);
        if len >= MAX_QUEUE_LEN {
            return Err(Error::QueueFull { len });
        }

        // Classify and resolve the input.
        let resolver = self.sources.resolver(&request.input);
        let mut tracks = resolver.resolve().await?;
        if tracks.is_empty() {
            return Err(Error::Resolution("Nothing found for that request".to_string()));
        }
        // Free text resolves to search results; only the top hit plays.
        if !resolver.is_valid() {
            tracks.truncate(1);
        }

        // Dedupe against the current queue by (platform, id).
        let mut fresh = Vec::new();
        let mut duplicates = Vec::new();
        for track in tracks {
            if self
                .queue
                .find_by_track_id(chat, track.platform, &track.id)
                .is_some()
            {
                duplicates.push(track);
            } else {
                fresh.push(track);
            }
        }
        if fresh.is_empty() {
            return Ok(EnqueueOutcome {
                started: None,
                queued: Vec::new(),
                duplicates,
            });
        }

        let was_active = self.queue.is_active(chat);
        let mut outcome = EnqueueOutcome {
            duplicates,
            ..Default::default()
        };

        if !was_active {
            self.queue.set_active(chat, true);
        }

        let mut queued_any = false;
        for track in fresh {
            let queued_track = QueuedTrack::new(track.clone(), request.requester.clone(), request.is_video);
            match self.queue.add(chat, queued_track) {
                Ok(position) => {
                    queued_any = true;
                    // Attachment bytes can only be fetched while the
                    // message reference is in hand.
                    if track.platform == Platform::Attachment {
                        match resolver.download(&track, request.is_video).await {
                            Ok(path) if position == 1 => self.queue.set_head_path(chat, path),
                            Ok(_) => {}
                            Err(e) => {
                                if !was_active {
                                    self.queue.clear(chat, true);
                                }
                                return Err(e);
                            }
                        }
                    }
                    if was_active || position > 1 {
                        outcome.queued.push((position, track.clone()));
                        self.notifier.queued(chat, position, &track).await;
                    } else {
                        outcome.started = Some(track);
                    }
                }
                Err(Error::QueueFull { .. }) => {
                    tracing::debug!(chat = %chat, "Queue filled mid-playlist, dropping the rest");
                    break;
                }
                Err(e) => {
                    if !was_active {
                        self.queue.clear(chat, true);
                    }
                    return Err(e);
                }
            }
        }

        if !was_active {
            if !queued_any {
                self.queue.set_active(chat, false);
                return Err(Error::QueueFull { len: MAX_QUEUE_LEN });
            }
            if let Err(e) = self.start_playback(chat).await {
                self.queue.clear(chat, true);
                return Err(e);
            }
        }

        Ok(outcome)
    }

    /// Bring the assistant in, materialize the head track, and start the
    /// stream. The chat lock is already held.
    async fn start_playback(&self, chat: ChatId) -> Result<()> {
        self.assistants.ensure_joined(chat).await?;

        let head = self
            .queue
            .playing(chat)
            .ok_or_else(|| Error::Internal("Queue emptied before playback".to_string()))?;

        let path = match &head.local_path {
            Some(path) => path.clone(),
            None => {
                let path = self.download_track(&head.track, head.is_video).await?;
                self.queue.set_head_path(chat, path.clone());
                path
            }
        };

        self.calls
            .play_media(chat, &path.to_string_lossy(), head.is_video, &DescriptorParams::default())
            .await?;

        self.backfill_duration(chat, &head, &path).await;
        if let Some(now) = self.queue.playing(chat) {
            self.notifier.now_playing(chat, &now).await;
        }
        Ok(())
    }

    /// Re-resolve a queued track into bytes on disk.
    async fn download_track(&self, track: &Track, is_video: bool) -> Result<PathBuf> {
        let resolver = self.sources.resolver_for_query(&track.url);
        if !resolver.is_valid() {
            return Err(Error::Materialization(format!(
                "Track URL no longer resolvable: {}",
                track.url
            )));
        }
        let full = resolver.get_track().await?;
        resolver.download(&full, is_video).await
    }

    async fn backfill_duration(&self, chat: ChatId, track: &QueuedTrack, path: &std::path::Path) {
        if track.track.duration_secs == 0 {
            if let Some(duration) = provider::probe_duration(path).await {
                self.queue.set_head_duration(chat, duration);
            }
        }
    }

    /// Advance after a stream end or a skip: replay loops, then promote
    /// the next track, then wind the chat down when the queue is dry.
    pub async fn advance(&self, chat: ChatId) {
        let lock = self.chat_lock(chat);
        let _guard = lock.lock().await;

        if self.queue.loop_count(chat) > 0 {
            self.queue.decrement_loop(chat);
            if let Some(current) = self.queue.playing(chat) {
                if let Some(path) = &current.local_path {
                    match self
                        .calls
                        .play_media(
                            chat,
                            &path.to_string_lossy(),
                            current.is_video,
                            &DescriptorParams::default(),
                        )
                        .await
                    {
                        Ok(()) => return,
                        Err(e) => {
                            self.notifier.error(chat, e.kind(), &e.to_string()).await;
                            self.queue.clear(chat, true);
                            return;
                        }
                    }
                }
            }
        }

        loop {
            self.queue.pop_head(chat, true);

            let Some(next) = self.queue.playing(chat) else {
                self.finish(chat).await;
                return;
            };

            let path = match &next.local_path {
                Some(path) => path.clone(),
                None => match self.download_track(&next.track, next.is_video).await {
                    Ok(path) => {
                        self.queue.set_head_path(chat, path.clone());
                        path
                    }
                    Err(e) => {
                        // Skip the dead track and keep the queue moving.
                        self.notifier
                            .error(
                                chat,
                                e.kind(),
                                &format!("Skipping {}: {e}", next.track.title),
                            )
                            .await;
                        continue;
                    }
                },
            };

            match self
                .calls
                .play_media(chat, &path.to_string_lossy(), next.is_video, &DescriptorParams::default())
                .await
            {
                Ok(()) => {
                    self.backfill_duration(chat, &next, &path).await;
                    if let Some(now) = self.queue.playing(chat) {
                        self.notifier.now_playing(chat, &now).await;
                    }
                    return;
                }
                Err(e) => {
                    // A failed play start leaves the chat inactive with
                    // one notification; later tracks are not purged here
                    // beyond the failing head's state.
                    self.notifier.error(chat, e.kind(), &e.to_string()).await;
                    self.queue.set_active(chat, false);
                    self.queue.clear(chat, true);
                    return;
                }
            }
        }
    }

    /// Queue ran dry: leave the conference, forget the chat, say so once.
    async fn finish(&self, chat: ChatId) {
        if let Err(e) = self.calls.stop(chat).await {
            tracing::debug!(chat = %chat, error = %e, "Leave failed during wind-down");
        }
        self.queue.clear(chat, true);
        self.notifier.queue_finished(chat).await;
    }

    async fn require_control(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.admission.ensure_bot_privileges(chat).await?;
        if !self.admission.can_admin(chat, user).await? {
            return Err(Error::Admission(
                "You are not allowed to control playback in this chat".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn skip(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.require_control(chat, user).await?;
        if !self.queue.is_active(chat) {
            return Err(Error::InvalidInput("Nothing is playing here".to_string()));
        }
        // A skip must not replay the current track.
        self.queue.set_loop(chat, 0)?;
        self.advance(chat).await;
        Ok(())
    }

    pub async fn stop(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.require_control(chat, user).await?;
        let lock = self.chat_lock(chat);
        let _guard = lock.lock().await;

        let result = self.calls.stop(chat).await;
        self.queue.clear(chat, true);
        result
    }

    pub async fn pause(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.require_control(chat, user).await?;
        self.calls.pause(chat).await
    }

    pub async fn resume(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.require_control(chat, user).await?;
        self.calls.resume(chat).await
    }

    pub async fn mute(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.require_control(chat, user).await?;
        self.calls.mute(chat).await
    }

    pub async fn unmute(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.require_control(chat, user).await?;
        self.calls.unmute(chat).await
    }

    /// Seek forward (or back) by `delta_secs` relative to played time.
    pub async fn seek(&self, chat: ChatId, user: UserId, delta_secs: i64) -> Result<()> {
        self.require_control(chat, user).await?;
        let lock = self.chat_lock(chat);
        let _guard = lock.lock().await;

        let current = self
            .queue
            .playing(chat)
            .ok_or_else(|| Error::InvalidInput("Nothing is playing here".to_string()))?;
        let path = current
            .local_path
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("Current track is not seekable yet".to_string()))?;

        let played = i64::from(self.calls.played_time(chat).await?);
        let duration = i64::from(current.track.duration_secs);
        let target = played + delta_secs;

        if target < 0 {
            return Err(Error::InvalidInput(
                "Cannot seek before the start of the track".to_string(),
            ));
        }
        if duration > 0 && target >= duration {
            return Err(Error::InvalidInput(format!(
                "Cannot seek to {target}s on a {duration}s track"
            )));
        }

        self.calls
            .seek(
                chat,
                &path.to_string_lossy(),
                target as u32,
                duration as u32,
                current.is_video,
            )
            .await
    }

    pub async fn set_loop(&self, chat: ChatId, user: UserId, count: u8) -> Result<()> {
        self.require_control(chat, user).await?;
        self.queue.set_loop(chat, count)
    }

    pub async fn remove_at(&self, chat: ChatId, user: UserId, index: usize) -> Result<Track> {
        self.require_control(chat, user).await?;
        let lock = self.chat_lock(chat);
        let _guard = lock.lock().await;
        Ok(self.queue.remove_at(chat, index)?.track)
    }

    pub async fn speed(&self, chat: ChatId, user: UserId, factor: f64) -> Result<()> {
        self.require_control(chat, user).await?;
        let lock = self.chat_lock(chat);
        let _guard = lock.lock().await;
        self.calls.change_speed(chat, factor).await
    }

    /// Read-side snapshot; takes no lock.
    #[must_use]
    pub fn queue_view(&self, chat: ChatId) -> QueueView {
        let snapshot = self.queue.snapshot(chat);
        let total = snapshot.len();
        let mut iter = snapshot.into_iter();
        QueueView {
            now: iter.next(),
            upcoming: iter.collect(),
            total,
        }
    }

    /// Membership update observed in a chat: refresh the assistant status
    /// cache, and drop the admin roster when the change targets the bot or
    /// the assistant.
    pub fn note_participant_change(&self, change: &crate::gateway::ParticipantChange) {
        self.assistants.note_participant_change(change);
        if change.user == self.admission.bot_user_id()
            || self.assistants.is_assistant_user(change.user)
        {
            self.admission.invalidate(change.chat);
        }
    }

    async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::StreamEnded { chat, kind } => {
                // The video leg ends alongside the audio leg; only audio
                // drives advancement.
                if kind == StreamKind::Video {
                    tracing::debug!(chat = %chat, "Ignoring video stream end");
                    return;
                }
                self.advance(chat).await;
            }
            EngineEvent::ConferenceClosed { chat } => {
                tracing::debug!(chat = %chat, "Conference closed, clearing chat");
                let lock = self.chat_lock(chat);
                let _guard = lock.lock().await;
                self.queue.clear(chat, true);
            }
            EngineEvent::IncomingCall { chat } => {
                let Some(notice) = &self.call_notice else {
                    return;
                };
                if let Err(e) = self
                    .calls
                    .play_media(chat, &notice.to_string_lossy(), false, &DescriptorParams::default())
                    .await
                {
                    tracing::debug!(chat = %chat, error = %e, "Failed to answer direct call");
                }
            }
        }
    }

    /// Consume engine events until the channel closes. Spawned once at
    /// startup; this is the only place engine callbacks touch chat state.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: EngineEventReceiver,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                coordinator.handle_event(event).await;
            }
            tracing::debug!("Engine event channel closed, stopping event loop");
        })
    }
}
