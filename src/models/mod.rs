pub mod id;
pub mod member;
pub mod settings;
pub mod track;

pub use id::{AssistantKey, ChatId, UserId};
pub use member::{AdminEntry, AdminRights, MemberStatus};
pub use settings::{AccessMode, ChatSettings};
pub use track::{Platform, QueuedTrack, Track};
