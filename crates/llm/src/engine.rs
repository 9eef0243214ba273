use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Speaker role of one turn.
///
/// Roles outside the three known ones are carried verbatim so foreign transcripts
/// survive a load/save cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for Role {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
}

impl CompletionRequest {
    pub fn new(messages: Vec<PromptMessage>, temperature: f64, max_tokens: u64) -> Self {
        Self {
            messages,
            temperature,
            max_tokens,
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EngineResult<T> = Result<T, EngineError>;

/// Lazy sequence of text deltas. An `Err` item ends the generation.
pub type DeltaStream = BoxStream<'static, EngineResult<String>>;

/// Receives load progress in `0.0..=1.0`. Values are not guaranteed to be monotonic.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("model identifier is empty"))]
    EmptyModelId { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("model '{model_id}' is not served by {endpoint}"))]
    ModelUnavailable {
        stage: &'static str,
        model_id: String,
        endpoint: String,
    },
    #[snafu(display("completion request has no user or assistant messages"))]
    EmptyMessageSet { stage: &'static str },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("{message}"))]
    Engine {
        stage: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Free-form failure for engines that do not map onto the HTTP-backed variants.
    pub fn engine(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Engine {
            stage,
            message: message.into(),
        }
    }
}

/// Something that can turn a model identifier into a ready-to-use handle.
pub trait InferenceEngine: Send + Sync {
    fn initialize<'a>(
        &'a self,
        model_id: &'a str,
        progress: ProgressSink,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn EngineHandle>>>;
}

/// A loaded model. Handles are immutable; reloading produces a new one.
pub trait EngineHandle: Send + Sync {
    fn model_id(&self) -> &str;
    fn stream_completion(&self, request: CompletionRequest)
    -> BoxFuture<'_, EngineResult<DeltaStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_roles_parse_and_unknown_roles_are_preserved() {
        assert_eq!(Role::from("user"), Role::User);
        assert_eq!(Role::from("assistant"), Role::Assistant);
        assert_eq!(Role::from("system"), Role::System);
        assert_eq!(Role::from("tool"), Role::Other("tool".to_string()));
        assert_eq!(String::from(Role::Other("narrator".into())), "narrator");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn free_form_engine_error_displays_its_message() {
        let error = EngineError::engine("test", "device lost");
        assert_eq!(error.to_string(), "device lost");
    }
}
