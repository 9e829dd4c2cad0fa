use serde::{Deserialize, Serialize};

use super::UserId;

/// Admin rights bitmask, as reported by the messaging platform for one
/// chat administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdminRights(pub u32);

impl AdminRights {
    pub const MANAGE_CALL: u32 = 1 << 0;
    pub const INVITE_USERS: u32 = 1 << 1;
    pub const BAN_USERS: u32 = 1 << 2;
    pub const DELETE_MESSAGES: u32 = 1 << 3;
    pub const PIN_MESSAGES: u32 = 1 << 4;
    pub const CHANGE_INFO: u32 = 1 << 5;
    pub const PROMOTE_MEMBERS: u32 = 1 << 6;

    pub const NONE: u32 = 0;
    pub const ALL: u32 = !0;

    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(Self::NONE)
    }

    #[must_use]
    pub const fn all() -> Self {
        Self(Self::ALL)
    }

    #[must_use]
    pub const fn has(&self, right: u32) -> bool {
        (self.0 & right) == right
    }

    pub fn grant(&mut self, right: u32) {
        self.0 |= right;
    }

    pub fn revoke(&mut self, right: u32) {
        self.0 &= !right;
    }
}

impl Default for AdminRights {
    fn default() -> Self {
        Self::empty()
    }
}

/// Membership status of a user in a chat, as the core needs to see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Creator,
    Administrator(AdminRights),
    Member,
    /// Present but muted / limited; the bot can lift this.
    Restricted,
    Left,
    Banned,
}

impl MemberStatus {
    /// Present in the chat in some capacity.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(
            self,
            Self::Creator | Self::Administrator(_) | Self::Member | Self::Restricted
        )
    }

    /// Creator or administrator.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self, Self::Creator | Self::Administrator(_))
    }

    /// Rights this member holds. The creator holds everything; plain
    /// members hold nothing.
    #[must_use]
    pub const fn rights(&self) -> AdminRights {
        match self {
            Self::Creator => AdminRights::all(),
            Self::Administrator(rights) => *rights,
            _ => AdminRights::empty(),
        }
    }
}

/// One row of a chat's administrator roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminEntry {
    pub user: UserId,
    pub status: MemberStatus,
}

impl AdminEntry {
    #[must_use]
    pub fn new(user: UserId, status: MemberStatus) -> Self {
        Self { user, status }
    }

    #[must_use]
    pub const fn is_owner(&self) -> bool {
        matches!(self.status, MemberStatus::Creator)
    }
}
