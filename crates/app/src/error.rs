use hearth_llm::EngineError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("custom model selected but no custom model identifier is set"))]
    InvalidConfiguration { stage: &'static str },
    #[snafu(display("a response is still being generated; `{operation}` was rejected"))]
    Busy {
        stage: &'static str,
        operation: &'static str,
    },
    #[snafu(display("failed to load model '{model_id}': {source}"))]
    EngineInitialization {
        stage: &'static str,
        model_id: String,
        source: EngineError,
    },
    #[snafu(display("import failed: {details}"))]
    MalformedImport {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to serialize transcript on `{stage}`: {source}"))]
    SerializeTranscript {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;
