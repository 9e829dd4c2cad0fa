//! Voice-conference control layer.
//!
//! [`VoiceEngine`] is the opaque native engine, one instance per assistant
//! session; [`CallRouter`] routes per-chat operations to the right
//! instance and builds the shell-source descriptors the engine consumes.
//! The engine reports back through [`EngineEvent`]s on a channel the
//! coordinator owns; engine threads never touch chat state.

pub mod descriptor;
pub mod router;

pub use descriptor::{DescriptorParams, MediaDescriptor};
pub use router::CallRouter;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::ChatId;
use crate::Result;

/// Which leg of the stream an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// Events delivered by the native engine's callback threads.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A stream ran out of frames. Only the audio leg drives queue
    /// advancement; the video leg ends alongside it.
    StreamEnded { chat: ChatId, kind: StreamKind },
    /// The chat's voice conference was closed, or the assistant was
    /// removed from the chat.
    ConferenceClosed { chat: ChatId },
    /// Someone rang the assistant directly.
    IncomingCall { chat: ChatId },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

#[must_use]
pub fn event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

/// The native media engine, scoped to one assistant session.
///
/// All operations are keyed by chat; the engine multiplexes conferences
/// internally. Implementations wrap the native library and are expected to
/// push [`EngineEvent`]s from their callbacks onto the coordinator's
/// channel instead of calling back into the core.
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    async fn play(&self, chat: ChatId, descriptor: &MediaDescriptor) -> Result<()>;

    async fn pause(&self, chat: ChatId) -> Result<()>;

    async fn resume(&self, chat: ChatId) -> Result<()>;

    async fn mute(&self, chat: ChatId) -> Result<()>;

    async fn unmute(&self, chat: ChatId) -> Result<()>;

    /// Leave the conference and drop its stream state.
    async fn leave(&self, chat: ChatId) -> Result<()>;

    /// Seconds of the current stream already played out.
    async fn played_seconds(&self, chat: ChatId) -> Result<u32>;

    /// Tear down every conference this engine holds.
    async fn shutdown(&self) -> Result<()>;
}
