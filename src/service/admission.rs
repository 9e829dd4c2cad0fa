//! Rights and admission layer.
//!
//! Caches each chat's administrator roster (1 h TTL, with a short negative
//! entry when the platform call fails) and answers the admission
//! predicates that guard command execution.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::gateway::ChatGateway;
use crate::models::{AccessMode, AdminEntry, AdminRights, ChatId, UserId};
use crate::repository::ChatStore;
use crate::{Error, Result};

pub struct AdmissionService {
    gateway: Arc<dyn ChatGateway>,
    chats: Arc<dyn ChatStore>,
    roster: TtlCache<ChatId, Arc<Vec<AdminEntry>>>,
    /// The bot's operator; implicitly authorized everywhere.
    owner: UserId,
}

impl std::fmt::Debug for AdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("roster", &self.roster)
            .finish()
    }
}

impl AdmissionService {
    /// Roster entries live an hour.
    pub const ROSTER_TTL: Duration = Duration::from_secs(60 * 60);
    /// Failed fetches are negatively cached to avoid hammering the
    /// platform.
    pub const NEGATIVE_TTL: Duration = Duration::from_secs(10 * 60);

    #[must_use]
    pub fn new(gateway: Arc<dyn ChatGateway>, chats: Arc<dyn ChatStore>, owner: UserId) -> Self {
        Self {
            gateway,
            chats,
            roster: TtlCache::new(Self::ROSTER_TTL),
            owner,
        }
    }

    #[must_use]
    pub fn bot_user_id(&self) -> UserId {
        self.gateway.bot_user_id()
    }

    /// The chat's administrator roster, cached. On a fetch failure an
    /// empty roster is cached briefly and returned.
    pub async fn admins(&self, chat: ChatId, force_reload: bool) -> Arc<Vec<AdminEntry>> {
        if !force_reload {
            if let Some(entries) = self.roster.get(&chat) {
                return entries;
            }
        }

        match self.gateway.chat_administrators(chat).await {
            Ok(entries) => {
                let entries = Arc::new(entries);
                self.roster.insert(chat, entries.clone());
                entries
            }
            Err(e) => {
                tracing::warn!(chat = %chat, error = %e, "Failed to load admin roster");
                let empty = Arc::new(Vec::new());
                self.roster
                    .insert_with_ttl(chat, empty.clone(), Self::NEGATIVE_TTL);
                empty
            }
        }
    }

    /// Drop one chat's cached roster. Participant-change events targeting
    /// the bot or the assistant land here.
    pub fn invalidate(&self, chat: ChatId) {
        self.roster.remove(&chat);
    }

    fn find_admin(&self, entries: &[AdminEntry], user: UserId) -> Option<AdminEntry> {
        entries.iter().find(|e| e.user == user).cloned()
    }

    pub async fn is_admin(&self, chat: ChatId, user: UserId) -> bool {
        // A sender id equal to the chat id is an anonymous admin.
        if user.get() == chat.get() {
            return true;
        }
        let entries = self.admins(chat, false).await;
        self.find_admin(&entries, user)
            .is_some_and(|e| e.status.is_admin())
    }

    pub async fn is_owner(&self, chat: ChatId, user: UserId) -> bool {
        let entries = self.admins(chat, false).await;
        self.find_admin(&entries, user).is_some_and(|e| e.is_owner())
    }

    /// Admin, persisted auth user, or the bot operator.
    pub async fn is_authorized(&self, chat: ChatId, user: UserId) -> Result<bool> {
        if user == self.owner || self.is_admin(chat, user).await {
            return Ok(true);
        }
        Ok(self.chats.auth_users(chat).await?.contains(&user))
    }

    /// Whether `user` may enqueue tracks in `chat`.
    pub async fn can_play(&self, chat: ChatId, user: UserId) -> Result<bool> {
        let settings = self.chats.settings(chat).await?;
        Ok(match settings.play_mode {
            AccessMode::Everyone => true,
            AccessMode::Admins => self.is_admin(chat, user).await,
            AccessMode::Auth => self.is_authorized(chat, user).await?,
        })
    }

    /// Whether `user` may run playback-control commands in `chat`.
    pub async fn can_admin(&self, chat: ChatId, user: UserId) -> Result<bool> {
        let settings = self.chats.settings(chat).await?;
        Ok(match settings.admin_mode {
            AccessMode::Everyone => true,
            AccessMode::Admins => self.is_admin(chat, user).await,
            AccessMode::Auth => self.is_authorized(chat, user).await?,
        })
    }

    /// Precheck for every chat command: the bot must be present, be an
    /// admin, and hold the invite-users right.
    pub async fn ensure_bot_privileges(&self, chat: ChatId) -> Result<()> {
        let status = self
            .gateway
            .chat_member(chat, self.gateway.bot_user_id())
            .await?;

        if !status.is_present() {
            return Err(Error::BotNotAdmin(
                "I am not a member of this chat".to_string(),
            ));
        }
        if !status.is_admin() {
            return Err(Error::BotNotAdmin(
                "I need to be an admin in this chat".to_string(),
            ));
        }
        if !status.rights().has(AdminRights::INVITE_USERS) {
            return Err(Error::BotNotAdmin(
                "I need the invite-users right to bring my assistant in".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemberStatus;
    use crate::repository::ChatStore;
    use crate::test_helpers::{MemoryChatStore, MockGateway};

    const CHAT: ChatId = ChatId(-7);
    const ADMIN: UserId = UserId(10);
    const MEMBER: UserId = UserId(20);
    const AUTHED: UserId = UserId(30);
    const OWNER: UserId = UserId(1);

    async fn service() -> (AdmissionService, Arc<MemoryChatStore>) {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_admins(
            CHAT,
            vec![AdminEntry::new(
                ADMIN,
                MemberStatus::Administrator(AdminRights::all()),
            )],
        );
        let store = Arc::new(MemoryChatStore::new());
        store.add_auth_user(CHAT, AUTHED).await.unwrap();
        (
            AdmissionService::new(gateway, store.clone(), OWNER),
            store,
        )
    }

    #[tokio::test]
    async fn test_can_play_matrix() {
        let (admission, store) = service().await;

        // everyone
        assert!(admission.can_play(CHAT, MEMBER).await.unwrap());

        store.set_play_mode(CHAT, AccessMode::Admins).await.unwrap();
        assert!(admission.can_play(CHAT, ADMIN).await.unwrap());
        assert!(!admission.can_play(CHAT, MEMBER).await.unwrap());
        assert!(!admission.can_play(CHAT, AUTHED).await.unwrap());

        store.set_play_mode(CHAT, AccessMode::Auth).await.unwrap();
        assert!(admission.can_play(CHAT, ADMIN).await.unwrap());
        assert!(admission.can_play(CHAT, AUTHED).await.unwrap());
        assert!(!admission.can_play(CHAT, MEMBER).await.unwrap());
    }

    #[tokio::test]
    async fn test_can_admin_matrix() {
        let (admission, store) = service().await;

        // default admin_mode is admins
        assert!(admission.can_admin(CHAT, ADMIN).await.unwrap());
        assert!(!admission.can_admin(CHAT, AUTHED).await.unwrap());

        store.set_admin_mode(CHAT, AccessMode::Auth).await.unwrap();
        assert!(admission.can_admin(CHAT, AUTHED).await.unwrap());
        assert!(!admission.can_admin(CHAT, MEMBER).await.unwrap());

        store
            .set_admin_mode(CHAT, AccessMode::Everyone)
            .await
            .unwrap();
        assert!(admission.can_admin(CHAT, MEMBER).await.unwrap());
    }

    #[tokio::test]
    async fn test_operator_is_always_authorized() {
        let (admission, _store) = service().await;
        assert!(admission.is_authorized(CHAT, OWNER).await.unwrap());
    }

    #[tokio::test]
    async fn test_anonymous_sender_counts_as_admin() {
        let (admission, _store) = service().await;
        assert!(admission.is_admin(CHAT, UserId(CHAT.get())).await);
    }
}
