#![deny(unsafe_code)]

/// Conversation session: data model, lifecycle, streaming controller.
pub mod chat;
/// Layered runtime configuration for the binary.
pub mod config;
pub mod error;
pub mod persistence;
/// Generation settings and their live snapshot.
pub mod settings;
pub mod terminal;
/// Versioned interchange document for export and import.
pub mod transcript;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::{
    GenerationOutcome, LifecycleState, Message, MessageStore, SessionController, SessionObserver,
};
pub use config::AppConfig;
pub use error::{SessionError, SessionResult};
pub use settings::{Settings, Theme};
pub use transcript::TranscriptDocument;
