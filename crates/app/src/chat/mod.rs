pub mod controller;
/// Notification contracts between the controller and front-ends.
pub mod events;
/// Deterministic lifecycle state boundaries.
pub mod lifecycle;
/// Conversation data model.
pub mod message;
pub mod prompt;

pub use controller::SessionController;
pub use events::{GenerationOutcome, SessionObserver};
pub use lifecycle::{LifecycleState, LifecycleTransition, TransitionRejection, TransitionResult};
pub use message::{Message, MessageStore};
pub use prompt::{CANCELLATION_MARKER, CONCISE_DIRECTIVE};
