use crate::chat::lifecycle::LifecycleState;
use crate::chat::message::Message;
use crate::settings::Settings;

/// How one generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    /// The failure is recorded on the assistant message; the session stays usable.
    Failed(String),
}

/// Notifications emitted by the session controller.
///
/// Callbacks run inline on the controller's task and must not block. Every method
/// has a no-op default so front-ends only implement what they render.
pub trait SessionObserver: Send + Sync {
    fn on_messages_changed(&self, _messages: &[Message]) {}
    fn on_status_changed(&self, _state: LifecycleState, _detail: Option<&str>) {}
    fn on_progress(&self, _fraction: f64) {}
    fn on_error(&self, _message: &str) {}
    fn on_settings_changed(&self, _settings: &Settings) {}
}
