//! Assistant pool: maps each chat to exactly one long-lived user session.
//!
//! Bot accounts cannot sit in voice conferences, so every chat is bound to
//! a full-user session that attends on the bot's behalf. The binding is
//! sticky (persisted), and the pool knows how to get an assistant back
//! into a chat it left, was muted in, or was banned from.

use rand::prelude::IndexedRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::engine::VoiceEngine;
use crate::gateway::{ChatGateway, JoinOutcome, ParticipantChange, UserSession};
use crate::models::{AdminRights, AssistantKey, ChatId, MemberStatus, UserId};
use crate::repository::ChatStore;
use crate::{Error, Result};

/// One external user identity: its messaging client and its media engine.
pub struct AssistantSession {
    pub key: AssistantKey,
    pub client: Arc<dyn UserSession>,
    pub engine: Arc<dyn VoiceEngine>,
}

impl AssistantSession {
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.client.user_id()
    }
}

impl std::fmt::Debug for AssistantSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantSession")
            .field("key", &self.key)
            .field("user_id", &self.client.user_id())
            .finish()
    }
}

pub struct AssistantPool {
    sessions: HashMap<AssistantKey, Arc<AssistantSession>>,
    ordered_keys: Vec<AssistantKey>,
    chats: Arc<dyn ChatStore>,
    gateway: Arc<dyn ChatGateway>,
    invite_cache: TtlCache<ChatId, String>,
    status_cache: TtlCache<(ChatId, UserId), MemberStatus>,
}

impl std::fmt::Debug for AssistantPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantPool")
            .field("sessions", &self.ordered_keys)
            .finish()
    }
}

impl AssistantPool {
    /// Cached invite links and member statuses go stale together.
    const CACHE_TTL: Duration = Duration::from_secs(1000);

    #[must_use]
    pub fn new(chats: Arc<dyn ChatStore>, gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            sessions: HashMap::new(),
            ordered_keys: Vec::new(),
            chats,
            gateway,
            invite_cache: TtlCache::new(Self::CACHE_TTL),
            status_cache: TtlCache::new(Self::CACHE_TTL),
        }
    }

    /// Register a started session under the next `clientN` key.
    /// Called once per configured credential at startup.
    pub fn register(
        &mut self,
        client: Arc<dyn UserSession>,
        engine: Arc<dyn VoiceEngine>,
    ) -> AssistantKey {
        let key = AssistantKey::numbered(self.ordered_keys.len() + 1);
        let session = Arc::new(AssistantSession {
            key: key.clone(),
            client,
            engine,
        });
        self.sessions.insert(key.clone(), session);
        self.ordered_keys.push(key.clone());
        tracing::info!(key = %key, "Assistant session registered");
        key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered_keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered_keys.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &AssistantKey) -> Option<Arc<AssistantSession>> {
        self.sessions.get(key).cloned()
    }

    /// The chat's assistant: the sticky binding when it still points at a
    /// live session, else a uniformly random one, recorded for next time.
    pub async fn session_for(&self, chat: ChatId) -> Result<Arc<AssistantSession>> {
        if self.sessions.is_empty() {
            return Err(Error::Internal(
                "No assistant sessions available".to_string(),
            ));
        }

        if let Some(key) = self.chats.assistant(chat).await? {
            if let Some(session) = self.sessions.get(&key) {
                return Ok(session.clone());
            }
            tracing::warn!(chat = %chat, key = %key, "Bound assistant is gone, reassigning");
        }

        let key = self
            .ordered_keys
            .choose(&mut rand::rng())
            .expect("sessions is non-empty")
            .clone();
        self.chats.set_assistant(chat, &key).await?;
        Ok(self.sessions[&key].clone())
    }

    /// The assistant's membership status in a chat, cached.
    pub async fn member_status(
        &self,
        chat: ChatId,
        session: &AssistantSession,
    ) -> Result<MemberStatus> {
        let cache_key = (chat, session.user_id());
        if let Some(status) = self.status_cache.get(&cache_key) {
            return Ok(status);
        }

        let status = self.gateway.chat_member(chat, session.user_id()).await?;
        self.status_cache.insert(cache_key, status);
        Ok(status)
    }

    /// Apply a membership transition observed via participant events.
    pub fn note_participant_change(&self, change: &ParticipantChange) {
        self.status_cache
            .insert((change.chat, change.user), change.new_status);
    }

    /// Whether a user id belongs to one of the pool's sessions.
    #[must_use]
    pub fn is_assistant_user(&self, user: UserId) -> bool {
        self.sessions.values().any(|s| s.user_id() == user)
    }

    /// Make sure the chat's assistant is a member, recovering it from
    /// left/restricted/banned states, and return the session.
    ///
    /// Unban and unmute require the bot to be an admin with the ban-users
    /// right; without them the failure names the assistant so the chat's
    /// admins can act manually.
    pub async fn ensure_joined(&self, chat: ChatId) -> Result<Arc<AssistantSession>> {
        let session = self.session_for(chat).await?;
        let status = self.member_status(chat, &session).await?;

        match status {
            MemberStatus::Creator | MemberStatus::Administrator(_) | MemberStatus::Member => {
                Ok(session)
            }
            MemberStatus::Restricted => {
                self.require_ban_rights(chat, &session, "restricted").await?;
                self.gateway
                    .promote_to_member(chat, session.user_id())
                    .await?;
                self.status_cache
                    .insert((chat, session.user_id()), MemberStatus::Member);
                Ok(session)
            }
            MemberStatus::Banned => {
                self.require_ban_rights(chat, &session, "banned").await?;
                self.gateway
                    .promote_to_member(chat, session.user_id())
                    .await?;
                self.join(chat, &session).await?;
                Ok(session)
            }
            MemberStatus::Left => {
                self.join(chat, &session).await?;
                Ok(session)
            }
        }
    }

    async fn require_ban_rights(
        &self,
        chat: ChatId,
        session: &AssistantSession,
        state: &str,
    ) -> Result<()> {
        let bot_status = self
            .gateway
            .chat_member(chat, self.gateway.bot_user_id())
            .await?;
        if !bot_status.is_admin() || !bot_status.rights().has(AdminRights::BAN_USERS) {
            return Err(Error::Assistant {
                key: session.key.clone(),
                reason: format!(
                    "assistant (id {}) is {state} and I need admin rights with ban-users to fix that",
                    session.user_id()
                ),
            });
        }
        Ok(())
    }

    async fn join(&self, chat: ChatId, session: &AssistantSession) -> Result<()> {
        let invite_link = match self.invite_cache.get(&chat) {
            Some(link) => link,
            None => {
                let link = self.gateway.create_invite_link(chat).await?;
                self.invite_cache.insert(chat, link.clone());
                link
            }
        };

        let cache_key = (chat, session.user_id());
        match session.client.join_chat(&invite_link).await? {
            JoinOutcome::Joined | JoinOutcome::AlreadyParticipant => {
                self.status_cache.insert(cache_key, MemberStatus::Member);
                Ok(())
            }
            JoinOutcome::RequestSent => {
                let bot_status = self
                    .gateway
                    .chat_member(chat, self.gateway.bot_user_id())
                    .await?;
                if bot_status.is_admin() {
                    self.gateway
                        .approve_join_request(chat, session.user_id())
                        .await?;
                    self.status_cache.insert(cache_key, MemberStatus::Member);
                    Ok(())
                } else {
                    Err(Error::Assistant {
                        key: session.key.clone(),
                        reason: format!(
                            "join request for assistant (id {}) is pending approval",
                            session.user_id()
                        ),
                    })
                }
            }
            JoinOutcome::InviteExpired => {
                // A dead link may mean the link rotated or the account is
                // banned; either way the cached copy is useless now.
                self.invite_cache.remove(&chat);
                Err(Error::Assistant {
                    key: session.key.clone(),
                    reason: format!(
                        "invite link expired or assistant (id {}) is banned from this chat",
                        session.user_id()
                    ),
                })
            }
        }
    }

    /// Gracefully close media sessions, then messaging clients.
    pub async fn stop_all(&self) {
        for key in &self.ordered_keys {
            let session = &self.sessions[key];
            if let Err(e) = session.engine.shutdown().await {
                tracing::error!(key = %key, error = %e, "Error shutting down media session");
            }
        }
        for key in &self.ordered_keys {
            let session = &self.sessions[key];
            tracing::info!(key = %key, "Stopping assistant client");
            if let Err(e) = session.client.close().await {
                tracing::error!(key = %key, error = %e, "Error stopping client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::JoinOutcome;
    use crate::test_helpers::{MemoryChatStore, MockEngine, MockGateway, MockUserSession};
    use std::sync::atomic::Ordering;

    const CHAT: ChatId = ChatId(-42);

    fn pool() -> (
        AssistantPool,
        Arc<MockGateway>,
        Arc<MemoryChatStore>,
        Arc<MockUserSession>,
    ) {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryChatStore::new());
        let session = Arc::new(MockUserSession::new(UserId(2000)));
        let mut pool = AssistantPool::new(store.clone(), gateway.clone());
        pool.register(session.clone(), Arc::new(MockEngine::new()));
        (pool, gateway, store, session)
    }

    #[tokio::test]
    async fn test_assignment_is_sticky() {
        let (pool, _gateway, store, _session) = pool();

        let first = pool.session_for(CHAT).await.unwrap();
        assert_eq!(first.key, AssistantKey::numbered(1));
        assert_eq!(
            store.assistant(CHAT).await.unwrap(),
            Some(AssistantKey::numbered(1))
        );

        let second = pool.session_for(CHAT).await.unwrap();
        assert_eq!(second.key, first.key);
    }

    #[tokio::test]
    async fn test_present_assistant_needs_no_join() {
        let (pool, gateway, _store, session) = pool();
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Member);

        pool.ensure_joined(CHAT).await.unwrap();
        assert_eq!(session.join_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_left_assistant_joins_via_invite() {
        let (pool, gateway, _store, session) = pool();
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Left);

        pool.ensure_joined(CHAT).await.unwrap();
        assert_eq!(session.join_calls.load(Ordering::SeqCst), 1);

        // Status cache now says member; a second call does not rejoin.
        pool.ensure_joined(CHAT).await.unwrap();
        assert_eq!(session.join_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restricted_assistant_is_unmuted_not_rejoined() {
        let (pool, gateway, _store, session) = pool();
        gateway.grant_bot_admin(CHAT, true);
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Restricted);

        pool.ensure_joined(CHAT).await.unwrap();
        assert!(gateway.promoted.lock().contains(&(CHAT, session.user_id())));
        assert_eq!(session.join_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restricted_without_bot_rights_fails() {
        let (pool, gateway, _store, session) = pool();
        gateway.grant_bot_admin(CHAT, false);
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Restricted);

        let err = pool.ensure_joined(CHAT).await.unwrap_err();
        assert!(matches!(err, Error::Assistant { .. }));
        assert!(gateway.promoted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pending_join_auto_approved_by_admin_bot() {
        let (pool, gateway, _store, session) = pool();
        gateway.grant_bot_admin(CHAT, false);
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Left);
        session.join_outcomes.lock().clear();
        session.push_join_outcome(JoinOutcome::RequestSent);

        pool.ensure_joined(CHAT).await.unwrap();
        assert!(gateway
            .approved_joins
            .lock()
            .contains(&(CHAT, session.user_id())));
    }

    #[tokio::test]
    async fn test_pending_join_without_admin_bot_surfaces() {
        let (pool, gateway, _store, session) = pool();
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Left);
        session.join_outcomes.lock().clear();
        session.push_join_outcome(JoinOutcome::RequestSent);

        let err = pool.ensure_joined(CHAT).await.unwrap_err();
        match err {
            Error::Assistant { reason, .. } => assert!(reason.contains("pending")),
            other => panic!("expected assistant failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_invite_surfaces_and_drops_cached_link() {
        let (pool, gateway, _store, session) = pool();
        gateway.set_member(CHAT, session.user_id(), MemberStatus::Left);
        session.join_outcomes.lock().clear();
        session.push_join_outcome(JoinOutcome::InviteExpired);

        let err = pool.ensure_joined(CHAT).await.unwrap_err();
        match err {
            Error::Assistant { reason, .. } => assert!(reason.contains("expired")),
            other => panic!("expected assistant failure, got {other:?}"),
        }
        assert!(pool.invite_cache.get(&CHAT).is_none());
    }

    #[tokio::test]
    async fn test_stop_all_closes_clients() {
        let (pool, _gateway, _store, session) = pool();
        pool.stop_all().await;
        assert!(session.closed.load(Ordering::SeqCst));
    }
}
