use std::sync::Arc;

use futures::StreamExt;
use futures::future;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use snafu::{ResultExt, ensure};

use super::engine::{
    BoxFuture, CompletionRequest, CompletionsFailedSnafu, DeltaStream, EmptyMessageSetSnafu,
    EmptyModelIdSnafu, EngineError, EngineHandle, EngineResult, HttpClientSnafu, InferenceEngine,
    ModelFetchStatusSnafu, ModelPayloadParseSnafu, ModelUnavailableSnafu, ProgressSink,
    PromptMessage, Role,
};

/// Ollama, llama.cpp and LM Studio all expose an OpenAI-compatible API here or close to it.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434/v1";

/// Local servers ignore the key but the client refuses to build without one.
pub const DEFAULT_API_KEY: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigEngineConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl RigEngineConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
        }
    }
}

impl Default for RigEngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT, DEFAULT_API_KEY)
    }
}

/// Inference engine backed by an OpenAI-compatible HTTP server, driven through Rig.
pub struct RigEngine {
    config: RigEngineConfig,
}

impl RigEngine {
    pub fn new(config: RigEngineConfig) -> Self {
        Self { config }
    }

    /// Local servers speak `/chat/completions`; the Responses API is OpenAI-only.
    fn build_client(config: &RigEngineConfig) -> EngineResult<openai::CompletionsClient> {
        let api_key = if config.api_key.is_empty() {
            DEFAULT_API_KEY
        } else {
            config.api_key.as_str()
        };

        let mut builder = openai::Client::builder().api_key(api_key);
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        let client = builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })?;
        Ok(client.completions_api())
    }

    async fn fetch_model_ids(client: &openai::CompletionsClient) -> EngineResult<Vec<String>> {
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| EngineError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let model_ids = extract_model_ids(&payload).map_err(|error| {
            ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: error.to_string(),
            }
            .build()
        })?;
        if model_ids.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in server response".to_string(),
            }
            .fail();
        }

        Ok(model_ids)
    }
}

impl InferenceEngine for RigEngine {
    fn initialize<'a>(
        &'a self,
        model_id: &'a str,
        progress: ProgressSink,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn EngineHandle>>> {
        Box::pin(async move {
            let model_id = model_id.trim();
            ensure!(
                !model_id.is_empty(),
                EmptyModelIdSnafu {
                    stage: "rig-initialize",
                }
            );

            progress(0.0);
            let client = Self::build_client(&self.config)?;
            progress(0.5);

            match Self::fetch_model_ids(&client).await {
                Ok(ids) => {
                    ensure!(
                        ids.iter().any(|id| id == model_id),
                        ModelUnavailableSnafu {
                            stage: "rig-initialize-check-model",
                            model_id: model_id.to_string(),
                            endpoint: self.config.endpoint.clone(),
                        }
                    );
                }
                // Some servers do not implement the listing; trust the caller's identifier.
                Err(
                    error @ (EngineError::ModelPayloadParse { .. }
                    | EngineError::ModelFetchStatus { status: 404, .. }),
                ) => {
                    tracing::warn!(
                        model_id = %model_id,
                        endpoint = %self.config.endpoint,
                        error = %error,
                        "model listing unavailable; continuing with requested model"
                    );
                }
                Err(error) => return Err(error),
            }

            progress(1.0);
            tracing::info!(
                model_id = %model_id,
                endpoint = %self.config.endpoint,
                "rig engine initialized"
            );

            let handle: Arc<dyn EngineHandle> = Arc::new(RigEngineHandle {
                client,
                model_id: model_id.to_string(),
            });
            Ok(handle)
        })
    }
}

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::completion::streaming::StreamingCompletionResponse,
>;

struct RigEngineHandle {
    client: openai::CompletionsClient,
    model_id: String,
}

impl RigEngineHandle {
    fn to_rig_message(message: &PromptMessage) -> Option<RigMessage> {
        match &message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
            Role::Other(raw) => {
                tracing::debug!(role = %raw, "dropping message with unsupported role");
                None
            }
        }
    }

    fn merged_preamble(request: &CompletionRequest) -> Option<String> {
        // Rig exposes a single preamble field, so system-role messages are folded into it.
        let parts = request
            .messages
            .iter()
            .filter(|message| matches!(message.role, Role::System))
            .map(|message| message.content.trim())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn open_stream(&self, request: CompletionRequest) -> EngineResult<RigStreamingResponse> {
        let model = self.client.completion_model(self.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %self.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
            }
            .fail();
        };

        let mut builder = model
            .completion_request(prompt)
            .messages(messages)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens);

        if let Some(preamble) = Self::merged_preamble(&request) {
            builder = builder.preamble(preamble);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }
}

impl EngineHandle for RigEngineHandle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, EngineResult<DeltaStream>> {
        Box::pin(async move {
            let response = self.open_stream(request).await?;
            let deltas = response.filter_map(|item| {
                future::ready(match item {
                    Ok(StreamedAssistantContent::Text(text)) => Some(Ok(text.text)),
                    // Reasoning and tool traffic never reach the transcript.
                    Ok(_) => None,
                    Err(source) => Some(Err(EngineError::CompletionsFailed {
                        stage: "stream-chunk",
                        source,
                    })),
                })
            });
            Ok(deltas.boxed())
        })
    }
}

#[derive(Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

fn extract_model_ids(payload: &str) -> Result<Vec<String>, serde_json::Error> {
    let listing = serde_json::from_str::<ModelListing>(payload)?;
    let mut ids = listing
        .data
        .into_iter()
        .map(|entry| entry.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    Ok(ids)
}
