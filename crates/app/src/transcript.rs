//! Interchange document used to move a conversation between installs.

use chrono::{DateTime, Utc};
use hearth_llm::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;

use crate::chat::Message;
use crate::chat::message::timestamp;
use crate::error::{MalformedImportSnafu, SerializeTranscriptSnafu, SessionResult};
use crate::settings::Settings;

pub const TRANSCRIPT_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptDocument {
    pub version: u64,
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<TranscriptMessage>,
    pub settings: TranscriptSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSettings {
    pub temperature: f64,
    pub max_tokens: u64,
    pub concise_mode: bool,
}

impl TranscriptDocument {
    pub fn to_json_pretty(&self) -> SessionResult<String> {
        serde_json::to_string_pretty(self).context(SerializeTranscriptSnafu {
            stage: "transcript-to-json",
        })
    }
}

/// Builds the interchange document. In-flight messages are left out.
pub fn export(settings: &Settings, messages: &[Message]) -> TranscriptDocument {
    TranscriptDocument {
        version: TRANSCRIPT_VERSION,
        model: settings.model_label(),
        system_prompt: settings.system_prompt.clone(),
        messages: messages
            .iter()
            .filter(|message| !message.is_streaming)
            .map(|message| TranscriptMessage {
                role: message.role.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
            })
            .collect(),
        settings: TranscriptSettings {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            concise_mode: settings.concise_mode,
        },
    }
}

pub fn suggested_file_name(now: DateTime<Utc>) -> String {
    format!("chat-{}.json", now.timestamp_millis())
}

/// Result of decoding a document against the current settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedTranscript {
    pub messages: Vec<Message>,
    pub settings: Settings,
}

pub fn import_str(raw: &str, prior: &Settings) -> SessionResult<ImportedTranscript> {
    import(&parse_document(raw)?, prior)
}

pub fn parse_document(raw: &str) -> SessionResult<Value> {
    serde_json::from_str::<Value>(raw).map_err(|error| {
        MalformedImportSnafu {
            stage: "import-parse-json",
            details: format!("invalid JSON: {error}"),
        }
        .build()
    })
}

/// Decodes a document without touching any session state.
///
/// Only `version` and `messages` are required. Roles are taken as-is. Each of
/// `temperature`, `maxTokens` and `conciseMode` keeps its prior value unless the
/// document carries a truthy one; model selection and theme are never imported.
pub fn import(document: &Value, prior: &Settings) -> SessionResult<ImportedTranscript> {
    let Some(fields) = document.as_object() else {
        return MalformedImportSnafu {
            stage: "import-root",
            details: "document is not a JSON object",
        }
        .fail();
    };

    if present(fields.get("version")).is_none() {
        return MalformedImportSnafu {
            stage: "import-version",
            details: "missing `version`",
        }
        .fail();
    }

    let Some(entries) = present(fields.get("messages")) else {
        return MalformedImportSnafu {
            stage: "import-messages",
            details: "missing `messages`",
        }
        .fail();
    };
    let Some(entries) = entries.as_array() else {
        return MalformedImportSnafu {
            stage: "import-messages",
            details: "`messages` is not a list",
        }
        .fail();
    };

    let messages = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::from_value::<Message>(entry.clone())
                .map(|message| Message {
                    is_streaming: false,
                    ..message
                })
                .map_err(|error| {
                    MalformedImportSnafu {
                        stage: "import-message-entry",
                        details: format!("message {index}: {error}"),
                    }
                    .build()
                })
        })
        .collect::<SessionResult<Vec<_>>>()?;

    Ok(ImportedTranscript {
        messages,
        settings: merge_settings(fields, prior),
    })
}

fn merge_settings(fields: &serde_json::Map<String, Value>, prior: &Settings) -> Settings {
    let section = fields.get("settings").and_then(Value::as_object);
    let setting = |key: &str| section.and_then(|section| present(section.get(key)));

    let temperature = setting("temperature")
        .and_then(Value::as_f64)
        .filter(|value| *value != 0.0 && value.is_finite())
        .unwrap_or(prior.temperature);
    let max_tokens = setting("maxTokens")
        .and_then(|value| {
            value
                .as_u64()
                .or_else(|| value.as_f64().filter(|value| *value >= 1.0).map(|value| value as u64))
        })
        .filter(|value| *value != 0)
        .unwrap_or(prior.max_tokens);
    let concise_mode = setting("conciseMode")
        .and_then(Value::as_bool)
        .filter(|value| *value)
        .unwrap_or(prior.concise_mode);

    // Older exports nested the prompt inside `settings`.
    let system_prompt = present(fields.get("systemPrompt"))
        .or_else(|| setting("systemPrompt"))
        .and_then(Value::as_str)
        .filter(|prompt| !prompt.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| prior.system_prompt.clone());

    Settings {
        temperature,
        max_tokens,
        concise_mode,
        system_prompt,
        ..prior.clone()
    }
    .normalized()
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|value| !value.is_null())
}
