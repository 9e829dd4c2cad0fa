pub mod admission;
pub mod assistant;
pub mod coordinator;
pub mod notifier;

pub use admission::AdmissionService;
pub use assistant::{AssistantPool, AssistantSession};
pub use coordinator::{EnqueueOutcome, EnqueueRequest, PlaybackCoordinator, QueueView};
pub use notifier::{ChatNotifier, Notifier, StatusMessage};
