use hearth_llm::{PromptMessage, Role};

use crate::chat::message::Message;
use crate::settings::Settings;

/// Appended to the system prompt when concise mode is on.
pub const CONCISE_DIRECTIVE: &str =
    "Keep your answers brief and to the point. Avoid unnecessary elaboration.";

/// Appended to a reply whose generation was stopped by the user.
pub const CANCELLATION_MARKER: &str = "\n\n[Generation stopped]";

pub fn system_prompt(settings: &Settings) -> String {
    if !settings.concise_mode {
        return settings.system_prompt.clone();
    }

    if settings.system_prompt.trim().is_empty() {
        CONCISE_DIRECTIVE.to_string()
    } else {
        format!("{}\n\n{}", settings.system_prompt, CONCISE_DIRECTIVE)
    }
}

/// Synthesized system turn followed by every settled message, in order.
pub fn build_prompt(settings: &Settings, history: &[Message]) -> Vec<PromptMessage> {
    std::iter::once(PromptMessage::new(Role::System, system_prompt(settings)))
        .chain(
            history
                .iter()
                .filter(|message| !message.is_streaming)
                .map(|message| PromptMessage::new(message.role.clone(), message.content.clone())),
        )
        .collect()
}

/// Content stored on a reply whose generation failed.
pub fn annotate_failure(partial: &str, error: &str) -> String {
    if partial.is_empty() {
        format!("Error: {error}")
    } else {
        format!("{partial}\n\n[Error: {error}]")
    }
}

/// Whether a reply talks about producing an image; front-ends may offer a hint.
pub fn mentions_image_generation(content: &str) -> bool {
    let lowered = content.to_lowercase();
    lowered.contains("generate") && lowered.contains("image")
}
