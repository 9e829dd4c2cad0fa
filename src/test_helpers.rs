//! Test doubles and fixtures shared by module and integration tests.
//!
//! Every external seam (messaging gateway, user sessions, the native
//! engine, persistence, notifications, media sources) has an in-memory
//! implementation here, plus a harness that wires a full coordinator from
//! them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{CallRouter, MediaDescriptor, VoiceEngine};
use crate::gateway::{
    AttachmentRef, ChatGateway, JoinOutcome, MessageRef, ParticipantChange, UserSession,
};
use crate::models::{
    AccessMode, AdminEntry, AdminRights, AssistantKey, ChatId, ChatSettings, MemberStatus,
    Platform, QueuedTrack, Track, UserId,
};
use crate::provider::{BackendKind, MediaSource, PlayInput, SourceFactory, SourceResolver};
use crate::queue::ChatQueueStore;
use crate::repository::ChatStore;
use crate::service::admission::AdmissionService;
use crate::service::assistant::AssistantPool;
use crate::service::coordinator::PlaybackCoordinator;
use crate::service::notifier::Notifier;
use crate::{Error, Result};

pub fn test_track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        platform: Platform::Youtube,
        url: format!("https://www.youtube.com/watch?v={id}"),
        title: format!("Track {id}"),
        duration_secs: 180,
        cover_url: None,
        cdn_url: None,
        decrypt_key: None,
        lyrics: None,
    }
}

pub fn test_queued(id: &str) -> QueuedTrack {
    QueuedTrack::new(test_track(id), "tester".to_string(), false)
}

// ==================== Messaging gateway ====================

pub struct MockGateway {
    pub bot_id: UserId,
    pub members: Mutex<HashMap<(ChatId, UserId), MemberStatus>>,
    pub admins: Mutex<HashMap<ChatId, Vec<AdminEntry>>>,
    pub sent: Mutex<Vec<(ChatId, String)>>,
    pub edits: Mutex<Vec<(i64, String)>>,
    pub attachments: Mutex<HashMap<String, AttachmentRef>>,
    pub approved_joins: Mutex<Vec<(ChatId, UserId)>>,
    pub promoted: Mutex<Vec<(ChatId, UserId)>>,
    pub admin_fetches: AtomicUsize,
    pub fail_admin_fetch: AtomicBool,
    next_message_id: AtomicI64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bot_id: UserId(1000),
            members: Mutex::new(HashMap::new()),
            admins: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            attachments: Mutex::new(HashMap::new()),
            approved_joins: Mutex::new(Vec::new()),
            promoted: Mutex::new(Vec::new()),
            admin_fetches: AtomicUsize::new(0),
            fail_admin_fetch: AtomicBool::new(false),
            next_message_id: AtomicI64::new(1),
        }
    }

    /// Give the bot admin + invite-users (+ ban-users when asked) in a
    /// chat, satisfying the command precheck.
    pub fn grant_bot_admin(&self, chat: ChatId, with_ban_rights: bool) {
        let mut rights = AdminRights::empty();
        rights.grant(AdminRights::INVITE_USERS);
        rights.grant(AdminRights::MANAGE_CALL);
        if with_ban_rights {
            rights.grant(AdminRights::BAN_USERS);
        }
        self.members
            .lock()
            .insert((chat, self.bot_id), MemberStatus::Administrator(rights));
    }

    pub fn set_member(&self, chat: ChatId, user: UserId, status: MemberStatus) {
        self.members.lock().insert((chat, user), status);
    }

    pub fn set_admins(&self, chat: ChatId, entries: Vec<AdminEntry>) {
        self.admins.lock().insert(chat, entries);
    }

    pub fn add_attachment(&self, link: &str, attachment: AttachmentRef) {
        self.attachments.lock().insert(link.to_string(), attachment);
    }

    #[must_use]
    pub fn messages_to(&self, chat: ChatId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatGateway for MockGateway {
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push((chat, text.to_string()));
        Ok(MessageRef { chat, message_id })
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()> {
        self.edits.lock().push((message.message_id, text.to_string()));
        Ok(())
    }

    async fn chat_member(&self, chat: ChatId, user: UserId) -> Result<MemberStatus> {
        Ok(self
            .members
            .lock()
            .get(&(chat, user))
            .copied()
            .unwrap_or(MemberStatus::Left))
    }

    async fn chat_administrators(&self, chat: ChatId) -> Result<Vec<AdminEntry>> {
        self.admin_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_admin_fetch.load(Ordering::SeqCst) {
            return Err(Error::Network("admin roster unavailable".to_string()));
        }
        Ok(self.admins.lock().get(&chat).cloned().unwrap_or_default())
    }

    async fn create_invite_link(&self, chat: ChatId) -> Result<String> {
        Ok(format!("https://t.me/+invite{}", chat.get().abs()))
    }

    async fn promote_to_member(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.promoted.lock().push((chat, user));
        self.members.lock().insert((chat, user), MemberStatus::Member);
        Ok(())
    }

    async fn approve_join_request(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.approved_joins.lock().push((chat, user));
        self.members.lock().insert((chat, user), MemberStatus::Member);
        Ok(())
    }

    async fn resolve_message_link(&self, link: &str) -> Result<AttachmentRef> {
        self.attachments
            .lock()
            .get(link)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("Cannot resolve link: {link}")))
    }

    async fn download_attachment(
        &self,
        attachment: &AttachmentRef,
        dest: &Path,
    ) -> Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, format!("attachment {}", attachment.message_id))?;
        Ok(dest.to_path_buf())
    }

    fn bot_user_id(&self) -> UserId {
        self.bot_id
    }
}

// ==================== Assistant user session ====================

pub struct MockUserSession {
    id: UserId,
    /// Outcomes returned by successive join attempts; repeats the last.
    pub join_outcomes: Mutex<VecDeque<JoinOutcome>>,
    pub join_calls: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockUserSession {
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.id
    }

    #[must_use]
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            join_outcomes: Mutex::new(VecDeque::from([JoinOutcome::Joined])),
            join_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push_join_outcome(&self, outcome: JoinOutcome) {
        self.join_outcomes.lock().push_back(outcome);
    }
}

#[async_trait]
impl UserSession for MockUserSession {
    fn user_id(&self) -> UserId {
        self.id
    }

    async fn join_chat(&self, _invite_link: &str) -> Result<JoinOutcome> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.join_outcomes.lock();
        Ok(if outcomes.len() > 1 {
            outcomes.pop_front().expect("non-empty")
        } else {
            *outcomes.front().expect("non-empty")
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==================== Native engine ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Play(ChatId, MediaDescriptor),
    Pause(ChatId),
    Resume(ChatId),
    Mute(ChatId),
    Unmute(ChatId),
    Leave(ChatId),
}

#[derive(Default)]
pub struct MockEngine {
    pub ops: Mutex<Vec<EngineOp>>,
    pub played: Mutex<HashMap<ChatId, u32>>,
    pub fail_next_play: AtomicBool,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_played(&self, chat: ChatId, secs: u32) {
        self.played.lock().insert(chat, secs);
    }

    #[must_use]
    pub fn plays(&self, chat: ChatId) -> Vec<MediaDescriptor> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                EngineOp::Play(c, desc) if *c == chat => Some(desc.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn total_plays(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, EngineOp::Play(_, _)))
            .count()
    }
}

#[async_trait]
impl VoiceEngine for MockEngine {
    async fn play(&self, chat: ChatId, descriptor: &MediaDescriptor) -> Result<()> {
        if self.fail_next_play.swap(false, Ordering::SeqCst) {
            return Err(Error::Engine("No active voice chat found".to_string()));
        }
        self.ops.lock().push(EngineOp::Play(chat, descriptor.clone()));
        Ok(())
    }

    async fn pause(&self, chat: ChatId) -> Result<()> {
        self.ops.lock().push(EngineOp::Pause(chat));
        Ok(())
    }

    async fn resume(&self, chat: ChatId) -> Result<()> {
        self.ops.lock().push(EngineOp::Resume(chat));
        Ok(())
    }

    async fn mute(&self, chat: ChatId) -> Result<()> {
        self.ops.lock().push(EngineOp::Mute(chat));
        Ok(())
    }

    async fn unmute(&self, chat: ChatId) -> Result<()> {
        self.ops.lock().push(EngineOp::Unmute(chat));
        Ok(())
    }

    async fn leave(&self, chat: ChatId) -> Result<()> {
        self.ops.lock().push(EngineOp::Leave(chat));
        Ok(())
    }

    async fn played_seconds(&self, chat: ChatId) -> Result<u32> {
        Ok(self.played.lock().get(&chat).copied().unwrap_or(0))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ==================== Persistence ====================

#[derive(Default)]
pub struct MemoryChatStore {
    pub chats: Mutex<HashMap<ChatId, ChatSettings>>,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn settings(&self, chat: ChatId) -> Result<ChatSettings> {
        Ok(self.chats.lock().get(&chat).cloned().unwrap_or_default())
    }

    async fn set_play_mode(&self, chat: ChatId, mode: AccessMode) -> Result<()> {
        self.chats.lock().entry(chat).or_default().play_mode = mode;
        Ok(())
    }

    async fn set_admin_mode(&self, chat: ChatId, mode: AccessMode) -> Result<()> {
        self.chats.lock().entry(chat).or_default().admin_mode = mode;
        Ok(())
    }

    async fn assistant(&self, chat: ChatId) -> Result<Option<AssistantKey>> {
        Ok(self
            .chats
            .lock()
            .get(&chat)
            .and_then(|s| s.assistant.clone()))
    }

    async fn set_assistant(&self, chat: ChatId, key: &AssistantKey) -> Result<()> {
        self.chats.lock().entry(chat).or_default().assistant = Some(key.clone());
        Ok(())
    }

    async fn remove_assistant(&self, chat: ChatId) -> Result<()> {
        if let Some(settings) = self.chats.lock().get_mut(&chat) {
            settings.assistant = None;
        }
        Ok(())
    }

    async fn auth_users(&self, chat: ChatId) -> Result<Vec<UserId>> {
        Ok(self
            .chats
            .lock()
            .get(&chat)
            .map(|s| s.auth_users.clone())
            .unwrap_or_default())
    }

    async fn add_auth_user(&self, chat: ChatId, user: UserId) -> Result<()> {
        let mut chats = self.chats.lock();
        let settings = chats.entry(chat).or_default();
        if !settings.auth_users.contains(&user) {
            settings.auth_users.push(user);
        }
        Ok(())
    }

    async fn remove_auth_user(&self, chat: ChatId, user: UserId) -> Result<()> {
        if let Some(settings) = self.chats.lock().get_mut(&chat) {
            settings.auth_users.retain(|u| *u != user);
        }
        Ok(())
    }
}

// ==================== Notifier ====================

#[derive(Default)]
pub struct RecordingNotifier {
    pub now_playing: Mutex<Vec<(ChatId, String)>>,
    pub queued: Mutex<Vec<(ChatId, usize, String)>>,
    pub finished: Mutex<Vec<ChatId>>,
    pub errors: Mutex<Vec<(ChatId, String, String)>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn finished_count(&self, chat: ChatId) -> usize {
        self.finished.lock().iter().filter(|c| **c == chat).count()
    }

    #[must_use]
    pub fn error_count(&self, chat: ChatId) -> usize {
        self.errors.lock().iter().filter(|(c, _, _)| *c == chat).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn now_playing(&self, chat: ChatId, track: &QueuedTrack) {
        self.now_playing
            .lock()
            .push((chat, track.track.title.clone()));
    }

    async fn queued(&self, chat: ChatId, position: usize, track: &Track) {
        self.queued.lock().push((chat, position, track.title.clone()));
    }

    async fn queue_finished(&self, chat: ChatId) {
        self.finished.lock().push(chat);
    }

    async fn error(&self, chat: ChatId, kind: &str, detail: &str) {
        self.errors
            .lock()
            .push((chat, kind.to_string(), detail.to_string()));
    }
}

// ==================== Media sources ====================

/// Fixture-backed media source: resolves preset tracks and "downloads"
/// them by writing placeholder bytes into the downloads directory.
pub struct FixtureSource {
    tracks: Vec<Track>,
    is_url: bool,
    downloads_dir: PathBuf,
    fail_download_ids: Vec<String>,
}

#[async_trait]
impl MediaSource for FixtureSource {
    fn is_valid(&self) -> bool {
        self.is_url
    }

    async fn get_info(&self) -> Result<Vec<Track>> {
        if self.tracks.is_empty() {
            return Err(Error::Resolution("No results".to_string()));
        }
        Ok(self.tracks.clone())
    }

    async fn search(&self) -> Result<Vec<Track>> {
        self.get_info().await
    }

    async fn get_track(&self) -> Result<Track> {
        self.tracks
            .first()
            .cloned()
            .ok_or_else(|| Error::Resolution("No results".to_string()))
    }

    async fn download(&self, track: &Track, _is_video: bool) -> Result<PathBuf> {
        if self.fail_download_ids.contains(&track.id) {
            return Err(Error::Materialization(format!(
                "Download failed for {}",
                track.id
            )));
        }
        std::fs::create_dir_all(&self.downloads_dir)?;
        let path = self.downloads_dir.join(format!("{}.mp3", track.id));
        std::fs::write(&path, b"pcm bytes")?;
        Ok(path)
    }
}

/// Source factory resolving from fixtures instead of the network.
///
/// Queries map to track lists; a queued track's URL maps back to its own
/// track for the download-on-demand path.
pub struct FixtureSourceFactory {
    pub downloads_dir: PathBuf,
    /// query (or URL) → result list
    pub fixtures: Mutex<HashMap<String, Vec<Track>>>,
    pub fail_download_ids: Mutex<Vec<String>>,
}

impl FixtureSourceFactory {
    #[must_use]
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self {
            downloads_dir,
            fixtures: Mutex::new(HashMap::new()),
            fail_download_ids: Mutex::new(Vec::new()),
        }
    }

    /// Register a query's results, and each track's URL for re-resolution.
    pub fn add_fixture(&self, query: &str, tracks: Vec<Track>) {
        let mut fixtures = self.fixtures.lock();
        for track in &tracks {
            fixtures.insert(track.url.clone(), vec![track.clone()]);
        }
        fixtures.insert(query.to_string(), tracks);
    }

    pub fn fail_download_of(&self, id: &str) {
        self.fail_download_ids.lock().push(id.to_string());
    }

    fn make(&self, query: &str) -> SourceResolver {
        let tracks = self.fixtures.lock().get(query).cloned().unwrap_or_default();
        let backend = FixtureSource {
            tracks,
            is_url: query.starts_with("http"),
            downloads_dir: self.downloads_dir.clone(),
            fail_download_ids: self.fail_download_ids.lock().clone(),
        };
        SourceResolver::with_backend(
            Box::new(backend),
            BackendKind::Youtube,
            Duration::from_secs(30),
            Duration::from_secs(180),
        )
    }
}

impl SourceFactory for FixtureSourceFactory {
    fn resolver(&self, input: &PlayInput) -> SourceResolver {
        match input {
            PlayInput::Text(query) | PlayInput::Link(query) => self.make(query),
            PlayInput::Attachment(attachment) => self.make(&format!(
                "attachment:{}:{}",
                attachment.chat.get(),
                attachment.message_id
            )),
        }
    }

    fn resolver_for_query(&self, query: &str) -> SourceResolver {
        self.make(query)
    }
}

// ==================== Full harness ====================

/// A coordinator wired entirely from doubles.
pub struct Harness {
    pub queue: Arc<ChatQueueStore>,
    pub gateway: Arc<MockGateway>,
    pub store: Arc<MemoryChatStore>,
    pub engine: Arc<MockEngine>,
    pub session: Arc<MockUserSession>,
    pub notifier: Arc<RecordingNotifier>,
    pub sources: Arc<FixtureSourceFactory>,
    pub assistants: Arc<AssistantPool>,
    pub admission: Arc<AdmissionService>,
    pub coordinator: Arc<PlaybackCoordinator>,
}

impl Harness {
    /// Build a harness with one assistant session and a bot that already
    /// holds the rights the precheck demands.
    #[must_use]
    pub fn new(downloads_dir: PathBuf) -> Self {
        let queue = Arc::new(ChatQueueStore::new());
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryChatStore::new());
        let engine = Arc::new(MockEngine::new());
        let session = Arc::new(MockUserSession::new(UserId(2000)));
        let notifier = Arc::new(RecordingNotifier::new());
        let sources = Arc::new(FixtureSourceFactory::new(downloads_dir));

        let mut pool = AssistantPool::new(store.clone(), gateway.clone());
        pool.register(session.clone(), engine.clone());
        let assistants = Arc::new(pool);

        let admission = Arc::new(AdmissionService::new(
            gateway.clone(),
            store.clone(),
            UserId(1),
        ));
        let calls = Arc::new(CallRouter::new(assistants.clone(), queue.clone()));
        let coordinator = Arc::new(PlaybackCoordinator::new(
            queue.clone(),
            admission.clone(),
            assistants.clone(),
            calls,
            sources.clone(),
            notifier.clone(),
            None,
        ));

        Self {
            queue,
            gateway,
            store,
            engine,
            session,
            notifier,
            sources,
            assistants,
            admission,
            coordinator,
        }
    }

    /// Put the assistant in the chat, grant the bot its rights, and open
    /// playback control to everyone, the steady state most scenarios
    /// start from.
    pub fn ready_chat(&self, chat: ChatId) {
        self.gateway.grant_bot_admin(chat, true);
        self.gateway
            .set_member(chat, self.session.user_id(), MemberStatus::Member);
        self.store.chats.lock().entry(chat).or_default().admin_mode = AccessMode::Everyone;
    }
}

/// Shorthand for a participant-change event.
#[must_use]
pub fn participant_change(chat: ChatId, user: UserId, status: MemberStatus) -> ParticipantChange {
    ParticipantChange {
        chat,
        user,
        new_status: status,
    }
}
