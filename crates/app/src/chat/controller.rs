use std::sync::Arc;

use futures::StreamExt;
use hearth_llm::{
    CompletionRequest, EngineHandle, InferenceEngine, ProgressSink, PromptMessage,
};
use hearth_storage::KeyValueStore;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::IntoError;
use tokio_util::sync::CancellationToken;

use crate::chat::events::{GenerationOutcome, SessionObserver};
use crate::chat::lifecycle::{LifecycleState, LifecycleTransition};
use crate::chat::message::{Message, MessageStore};
use crate::chat::prompt::{
    CANCELLATION_MARKER, annotate_failure, build_prompt, mentions_image_generation,
};
use crate::error::{BusySnafu, EngineInitializationSnafu, SessionResult};
use crate::persistence;
use crate::settings::{Settings, SettingsStore, Theme};
use crate::transcript::{self, TranscriptDocument};

/// Owns one conversation session and serializes every mutation of it.
///
/// Cloning is cheap and yields another handle to the same session, so a front-end can
/// run a generation on one task and call [`SessionController::stop`] from another.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn InferenceEngine>,
    store: Arc<dyn KeyValueStore>,
    observer: Arc<dyn SessionObserver>,
    settings: SettingsStore,
    // Lock order: `session` before `messages`. Neither is held across an await.
    session: Mutex<Session>,
    messages: Mutex<MessageStore>,
}

#[derive(Default)]
struct Session {
    lifecycle: LifecycleState,
    cancel: Option<CancellationToken>,
    engine_handle: Option<Arc<dyn EngineHandle>>,
    // Bumped on every load so a superseded initialization cannot install its handle.
    load_ticket: u64,
    last_error: Option<String>,
}

impl Session {
    fn transition(&mut self, transition: LifecycleTransition) -> bool {
        match self.lifecycle.apply(transition) {
            Ok(next) => {
                tracing::info!(from = %self.lifecycle, to = %next, "session lifecycle transition");
                self.lifecycle = next;
                true
            }
            Err(rejection) => {
                tracing::error!(?rejection, ?transition, "illegal lifecycle transition");
                false
            }
        }
    }
}

struct ActiveGeneration {
    token: CancellationToken,
    handle: Arc<dyn EngineHandle>,
    placeholder: usize,
    prompt: Vec<PromptMessage>,
}

impl SessionController {
    /// Builds a controller and hydrates settings and history from `store`.
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        store: Arc<dyn KeyValueStore>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let settings = persistence::load_settings(store.as_ref());
        let history = persistence::load_history(store.as_ref());
        tracing::info!(
            message_count = history.len(),
            model_id = %settings.model_id,
            "hydrated session from persistence"
        );

        Self {
            inner: Arc::new(Inner {
                engine,
                store,
                observer,
                settings: SettingsStore::new(settings),
                session: Mutex::new(Session::default()),
                messages: Mutex::new(history),
            }),
        }
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.session.lock().lifecycle
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.inner.settings.settings()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.lock().to_vec()
    }

    /// True between a `stop` and the end of the generation it targeted.
    pub fn cancel_requested(&self) -> bool {
        self.inner
            .session
            .lock()
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn loaded_model_id(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .engine_handle
            .as_ref()
            .map(|handle| handle.model_id().to_string())
    }

    /// Failure message of the last load, cleared when a new load starts.
    pub fn last_error(&self) -> Option<String> {
        self.inner.session.lock().last_error.clone()
    }

    /// Applies an edit to the settings, persists them and notifies the observer.
    ///
    /// Model selection is not validated here; `load_model` does that.
    pub fn update_settings(&self, edit: impl FnOnce(&mut Settings)) -> Arc<Settings> {
        let settings = self.inner.settings.update(edit);
        persistence::save_settings(self.inner.store.as_ref(), &settings);
        self.inner.observer.on_settings_changed(&settings);
        settings
    }

    pub fn toggle_theme(&self) -> Theme {
        self.update_settings(|settings| settings.theme = settings.theme.toggled())
            .theme
    }

    /// Initializes the engine for the selected model.
    ///
    /// Rejected with `Busy` while generating. A load started while another is still
    /// pending supersedes it; the earlier one resolves to `Ok(())` without effect.
    pub async fn load_model(&self) -> SessionResult<()> {
        let (ticket, model_id) = {
            let mut session = self.inner.session.lock();
            if session
                .lifecycle
                .apply(LifecycleTransition::LoadRequested)
                .is_err()
            {
                return BusySnafu {
                    stage: "load-model",
                    operation: "load_model",
                }
                .fail();
            }

            let model_id = match self.inner.settings.settings().resolve_model_id() {
                Ok(model_id) => model_id,
                Err(error) => {
                    drop(session);
                    tracing::warn!(error = %error, "refusing to load model");
                    self.inner.observer.on_error(&error.to_string());
                    return Err(error);
                }
            };

            session.transition(LifecycleTransition::LoadRequested);
            session.engine_handle = None;
            session.last_error = None;
            session.load_ticket += 1;
            (session.load_ticket, model_id)
        };

        tracing::info!(model_id = %model_id, ticket, "loading model");
        self.inner
            .observer
            .on_status_changed(LifecycleState::Loading, Some(&model_id));

        let observer = Arc::clone(&self.inner.observer);
        let progress: ProgressSink = Arc::new(move |fraction| observer.on_progress(fraction));
        let result = self.inner.engine.initialize(&model_id, progress).await;

        let mut session = self.inner.session.lock();
        if session.load_ticket != ticket {
            tracing::debug!(model_id = %model_id, ticket, "discarding superseded model load");
            return Ok(());
        }

        match result {
            Ok(handle) => {
                session.engine_handle = Some(handle);
                session.transition(LifecycleTransition::EngineReady);
                drop(session);

                self.inner
                    .observer
                    .on_status_changed(LifecycleState::Ready, Some(&model_id));
                Ok(())
            }
            Err(source) => {
                let error = EngineInitializationSnafu {
                    stage: "load-model-initialize",
                    model_id: model_id.clone(),
                }
                .into_error(source);
                let message = error.to_string();

                session.engine_handle = None;
                session.last_error = Some(message.clone());
                session.transition(LifecycleTransition::EngineFailed);
                drop(session);

                tracing::warn!(model_id = %model_id, error = %message, "model load failed");
                self.inner
                    .observer
                    .on_status_changed(LifecycleState::Error, Some(&message));
                self.inner.observer.on_error(&message);
                Err(error)
            }
        }
    }

    /// Sends `text` as a user turn and streams the reply.
    ///
    /// Returns `None` without side effects when the text is blank or the session is
    /// not `Ready`. Otherwise resolves once the reply has settled.
    pub async fn submit(&self, text: &str) -> Option<GenerationOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let active = self.begin_generation("submit", |messages| {
            messages.push(Message::user(text));
            true
        })?;
        Some(self.run_generation(active).await)
    }

    /// Replaces the trailing assistant reply with a fresh one for the same prompt.
    pub async fn regenerate(&self) -> Option<GenerationOutcome> {
        let active = self.begin_generation("regenerate", |messages| {
            messages.pop_trailing_assistant().is_some()
        })?;
        Some(self.run_generation(active).await)
    }

    /// Asks the running generation to stop after the current delta.
    ///
    /// Returns whether a generation was running.
    pub fn stop(&self) -> bool {
        let session = self.inner.session.lock();
        match (&session.cancel, session.lifecycle) {
            (Some(token), LifecycleState::Generating) => {
                tracing::debug!("cancellation requested");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Empties the history. Ignored while generating.
    pub fn clear(&self) -> bool {
        let snapshot = {
            let session = self.inner.session.lock();
            if session.lifecycle.is_generating() {
                tracing::debug!("clear ignored while generating");
                return false;
            }
            let mut messages = self.inner.messages.lock();
            messages.clear();
            messages.clone()
        };

        tracing::info!("conversation cleared");
        self.commit_history(&snapshot);
        true
    }

    pub fn export_transcript(&self) -> TranscriptDocument {
        let settings = self.inner.settings.settings();
        let messages = self.inner.messages.lock();
        transcript::export(&settings, messages.as_slice())
    }

    pub fn export_json(&self) -> SessionResult<String> {
        self.export_transcript().to_json_pretty()
    }

    /// Replaces the conversation with the one in `raw` and merges its settings.
    pub fn import_transcript(&self, raw: &str) -> SessionResult<usize> {
        match transcript::parse_document(raw) {
            Ok(document) => self.import_document(&document),
            Err(error) => {
                tracing::warn!(error = %error, "transcript import rejected");
                self.inner.observer.on_error(&error.to_string());
                Err(error)
            }
        }
    }

    /// Returns the number of imported messages. Nothing changes when the document is
    /// rejected.
    pub fn import_document(&self, document: &Value) -> SessionResult<usize> {
        let (settings, snapshot) = {
            let session = self.inner.session.lock();
            if session.lifecycle.is_generating() {
                return BusySnafu {
                    stage: "import-transcript",
                    operation: "import",
                }
                .fail();
            }

            let imported = match transcript::import(document, &self.inner.settings.settings()) {
                Ok(imported) => imported,
                Err(error) => {
                    drop(session);
                    tracing::warn!(error = %error, "transcript import rejected");
                    self.inner.observer.on_error(&error.to_string());
                    return Err(error);
                }
            };

            let settings = self.inner.settings.replace(imported.settings);
            let mut messages = self.inner.messages.lock();
            messages.replace(imported.messages);
            (settings, messages.clone())
        };

        tracing::info!(message_count = snapshot.len(), "transcript imported");
        persistence::save_settings(self.inner.store.as_ref(), &settings);
        self.inner.observer.on_settings_changed(&settings);
        self.commit_history(&snapshot);
        Ok(snapshot.len())
    }

    /// Moves to `Generating`, lets `prepare` edit the history, then appends the
    /// placeholder. All of it happens under one lock so no other command interleaves.
    fn begin_generation(
        &self,
        operation: &'static str,
        prepare: impl FnOnce(&mut MessageStore) -> bool,
    ) -> Option<ActiveGeneration> {
        let settings = self.inner.settings.settings();
        let (active, persisted, rendered) = {
            let mut session = self.inner.session.lock();
            if !session.lifecycle.accepts_input() {
                tracing::debug!(operation, state = %session.lifecycle, "generation not started");
                return None;
            }
            let Some(handle) = session.engine_handle.clone() else {
                tracing::error!(operation, "ready session has no engine handle");
                return None;
            };

            let mut messages = self.inner.messages.lock();
            if !prepare(&mut messages) {
                tracing::debug!(operation, "nothing to generate from");
                return None;
            }
            let persisted = messages.clone();
            let placeholder = messages.push_placeholder();
            let prompt = build_prompt(&settings, messages.as_slice());

            let token = CancellationToken::new();
            session.cancel = Some(token.clone());
            session.transition(LifecycleTransition::GenerationStarted);

            let active = ActiveGeneration {
                token,
                handle,
                placeholder,
                prompt,
            };
            (active, persisted, messages.to_vec())
        };

        // The sent prompt is durable before the first delta arrives.
        persistence::save_history(self.inner.store.as_ref(), &persisted);
        self.inner
            .observer
            .on_status_changed(LifecycleState::Generating, None);
        self.inner.observer.on_messages_changed(&rendered);
        Some(active)
    }

    async fn run_generation(&self, active: ActiveGeneration) -> GenerationOutcome {
        let ActiveGeneration {
            token,
            handle,
            placeholder,
            prompt,
        } = active;
        let settings = self.inner.settings.settings();
        let request = CompletionRequest::new(prompt, settings.temperature, settings.max_tokens);
        tracing::debug!(
            model_id = handle.model_id(),
            prompt_messages = request.messages.len(),
            temperature = request.temperature,
            max_tokens = request.max_tokens,
            "requesting completion"
        );

        let mut accumulated = String::new();
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = handle.stream_completion(request) => Some(opened),
        };

        let outcome = match opened {
            None => GenerationOutcome::Cancelled,
            Some(Err(error)) => GenerationOutcome::Failed(error.to_string()),
            Some(Ok(mut deltas)) => loop {
                // Cancellation wins over a delta that is already available.
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break GenerationOutcome::Cancelled,
                    next = deltas.next() => match next {
                        Some(Ok(delta)) => {
                            accumulated.push_str(&delta);
                            self.publish_partial(placeholder, &accumulated);
                        }
                        Some(Err(error)) => break GenerationOutcome::Failed(error.to_string()),
                        None => break GenerationOutcome::Completed,
                    },
                }
            },
        };

        self.finish_generation(placeholder, accumulated, outcome)
    }

    fn publish_partial(&self, placeholder: usize, accumulated: &str) {
        let rendered = {
            let mut messages = self.inner.messages.lock();
            match messages.get_mut(placeholder) {
                Some(message) if message.is_streaming => {
                    message.content.clear();
                    message.content.push_str(accumulated);
                }
                _ => {
                    tracing::error!(placeholder, "streaming placeholder went missing");
                    return;
                }
            }
            messages.to_vec()
        };
        self.inner.observer.on_messages_changed(&rendered);
    }

    /// Settles the placeholder and returns the outcome the history records.
    fn finish_generation(
        &self,
        placeholder: usize,
        accumulated: String,
        outcome: GenerationOutcome,
    ) -> GenerationOutcome {
        let (outcome, snapshot) = {
            let mut session = self.inner.session.lock();
            // A stop that lands after the stream ended still counts.
            let stopped = session
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled);
            let outcome = match outcome {
                GenerationOutcome::Completed if stopped => GenerationOutcome::Cancelled,
                outcome => outcome,
            };
            let content = match &outcome {
                GenerationOutcome::Completed => accumulated,
                GenerationOutcome::Cancelled => accumulated + CANCELLATION_MARKER,
                GenerationOutcome::Failed(error) => annotate_failure(&accumulated, error),
            };

            let mut messages = self.inner.messages.lock();
            if let Some(message) = messages.get_mut(placeholder) {
                message.has_image_request = matches!(outcome, GenerationOutcome::Completed)
                    && mentions_image_generation(&content);
                message.content = content;
                message.is_streaming = false;
            } else {
                tracing::error!(placeholder, "streaming placeholder went missing");
            }
            session.cancel = None;
            session.transition(LifecycleTransition::GenerationFinished);
            (outcome, messages.clone())
        };

        match &outcome {
            GenerationOutcome::Completed => tracing::info!("generation completed"),
            GenerationOutcome::Cancelled => tracing::debug!("generation cancelled"),
            GenerationOutcome::Failed(error) => {
                tracing::warn!(error = %error, "generation failed")
            }
        }

        self.commit_history(&snapshot);
        self.inner
            .observer
            .on_status_changed(LifecycleState::Ready, None);
        if let GenerationOutcome::Failed(error) = &outcome {
            self.inner.observer.on_error(error);
        }
        outcome
    }

    fn commit_history(&self, snapshot: &MessageStore) {
        persistence::save_history(self.inner.store.as_ref(), snapshot);
        self.inner.observer.on_messages_changed(snapshot.as_slice());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hearth_llm::{CUSTOM_MODEL_ID, EngineError, Role};
    use hearth_storage::MemoryKeyValueStore;
    use serde_json::json;

    use super::*;
    use crate::chat::prompt::CONCISE_DIRECTIVE;
    use crate::error::SessionError;
    use crate::persistence::{HISTORY_KEY, SETTINGS_KEY};
    use crate::testing::{RecordingObserver, ScriptedEngine, StreamScript, wait_until};

    struct Harness {
        controller: SessionController,
        engine: Arc<ScriptedEngine>,
        store: Arc<MemoryKeyValueStore>,
        observer: Arc<RecordingObserver>,
    }

    fn harness_with(engine: ScriptedEngine, store: MemoryKeyValueStore) -> Harness {
        let engine = Arc::new(engine);
        let store = Arc::new(store);
        let observer = Arc::new(RecordingObserver::default());
        let controller = SessionController::new(engine.clone(), store.clone(), observer.clone());
        Harness {
            controller,
            engine,
            store,
            observer,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedEngine::new(), MemoryKeyValueStore::new())
    }

    async fn ready_harness() -> Harness {
        let harness = harness();
        harness.controller.load_model().await.unwrap();
        harness
    }

    fn persisted_history(store: &MemoryKeyValueStore) -> Vec<Message> {
        store
            .get(HISTORY_KEY)
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
            .unwrap_or_default()
    }

    fn deltas(items: &[&str]) -> StreamScript {
        StreamScript::Deltas(items.iter().map(|item| Ok(item.to_string())).collect())
    }

    #[tokio::test]
    async fn submit_streams_a_reply_into_the_history() {
        let harness = ready_harness().await;
        harness.controller.update_settings(|settings| {
            settings.system_prompt = "Be terse.".to_string();
            settings.temperature = 0.7;
            settings.max_tokens = 512;
            settings.concise_mode = false;
        });
        harness.engine.push_script(deltas(&["4"]));

        let outcome = harness.controller.submit("  2+2?  ").await;

        assert_eq!(outcome, Some(GenerationOutcome::Completed));
        let messages = harness.controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!((messages[0].role.clone(), messages[0].content.as_str()), (Role::User, "2+2?"));
        assert_eq!(
            (messages[1].role.clone(), messages[1].content.as_str()),
            (Role::Assistant, "4")
        );
        assert!(messages.iter().all(|message| !message.is_streaming));
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Ready);

        let requests = harness.engine.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].temperature, 0.7);
        assert_eq!(requests[0].max_tokens, 512);
        assert_eq!(
            requests[0].messages,
            vec![
                PromptMessage::new(Role::System, "Be terse."),
                PromptMessage::new(Role::User, "2+2?"),
            ]
        );
        assert_eq!(persisted_history(&harness.store), messages);
    }

    #[tokio::test]
    async fn concise_mode_extends_the_system_turn() {
        let harness = ready_harness().await;
        harness.controller.update_settings(|settings| settings.concise_mode = true);
        harness.engine.push_script(deltas(&["ok"]));

        harness.controller.submit("hi").await;

        let system = &harness.engine.requests()[0].messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.ends_with(CONCISE_DIRECTIVE));
    }

    #[tokio::test]
    async fn blank_input_and_unready_sessions_are_ignored() {
        let harness = harness();
        assert_eq!(harness.controller.submit("hello").await, None);

        harness.controller.load_model().await.unwrap();
        assert_eq!(harness.controller.submit("   ").await, None);
        assert!(harness.controller.messages().is_empty());
        assert!(harness.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_text_and_returns_to_ready() {
        let harness = ready_harness().await;
        harness.engine.push_script(StreamScript::Deltas(vec![
            Ok("Hel".to_string()),
            Err(EngineError::engine("scripted-stream", "decoder crashed")),
            Ok("never".to_string()),
        ]));

        let outcome = harness.controller.submit("hi").await;

        assert_eq!(
            outcome,
            Some(GenerationOutcome::Failed("decoder crashed".to_string()))
        );
        let reply = harness.controller.messages().pop().unwrap();
        assert!(reply.content.starts_with("Hel"));
        assert!(reply.content.contains("decoder crashed"));
        assert!(!reply.content.contains("never"));
        assert!(!reply.is_streaming);
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Ready);
        assert_eq!(harness.observer.errors(), vec!["decoder crashed".to_string()]);
    }

    #[tokio::test]
    async fn failure_to_open_the_stream_is_local_to_the_reply() {
        let harness = ready_harness().await;
        harness
            .engine
            .push_script(StreamScript::OpenFailure("context window exceeded".to_string()));

        let outcome = harness.controller.submit("hi").await;

        assert!(matches!(outcome, Some(GenerationOutcome::Failed(_))));
        let reply = harness.controller.messages().pop().unwrap();
        assert_eq!(reply.content, "Error: context window exceeded");
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Ready);
        assert!(harness.controller.loaded_model_id().is_some());

        harness.engine.push_script(deltas(&["recovered"]));
        assert_eq!(
            harness.controller.submit("again").await,
            Some(GenerationOutcome::Completed)
        );
    }

    #[tokio::test]
    async fn stop_appends_the_marker_and_returns_to_ready() {
        let harness = ready_harness().await;
        let deltas = harness.engine.push_channel();

        let controller = harness.controller.clone();
        let generation = tokio::spawn(async move { controller.submit("tell me a story").await });

        deltas.send(Ok("Once".to_string())).unwrap();
        wait_until(|| {
            harness
                .controller
                .messages()
                .last()
                .is_some_and(|message| message.content == "Once")
        })
        .await;

        assert!(harness.controller.stop());
        assert!(harness.controller.cancel_requested());
        let outcome = generation.await.unwrap();
        drop(deltas);

        assert_eq!(outcome, Some(GenerationOutcome::Cancelled));
        let reply = harness.controller.messages().pop().unwrap();
        assert_eq!(reply.content, format!("Once{CANCELLATION_MARKER}"));
        assert!(!reply.is_streaming);
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Ready);
        assert!(!harness.controller.cancel_requested());
        assert!(!harness.controller.stop());
    }

    #[tokio::test]
    async fn stop_before_the_first_delta_still_marks_the_reply() {
        let harness = ready_harness().await;
        let deltas = harness.engine.push_channel();

        let controller = harness.controller.clone();
        let generation = tokio::spawn(async move { controller.submit("hi").await });
        wait_until(|| harness.controller.lifecycle_state().is_generating()).await;

        harness.controller.stop();
        assert_eq!(generation.await.unwrap(), Some(GenerationOutcome::Cancelled));
        drop(deltas);

        let reply = harness.controller.messages().pop().unwrap();
        assert_eq!(reply.content, CANCELLATION_MARKER);
    }

    #[tokio::test]
    async fn stop_after_the_last_delta_still_marks_the_reply() {
        let harness = ready_harness().await;
        let controller = harness.controller.clone();
        harness.engine.push_script(StreamScript::ThenRun(
            vec![Ok("All done".to_string())],
            Box::new(move || {
                assert!(controller.stop());
            }),
        ));

        let outcome = harness.controller.submit("finish up").await;

        assert_eq!(outcome, Some(GenerationOutcome::Cancelled));
        let reply = harness.controller.messages().pop().unwrap();
        assert_eq!(reply.content, format!("All done{CANCELLATION_MARKER}"));
        let persisted = persistence::load_history(harness.store.as_ref());
        assert_eq!(
            persisted.last().map(|message| message.content.as_str()),
            Some(reply.content.as_str())
        );
    }

    #[tokio::test]
    async fn at_most_one_streaming_message_and_it_is_last() {
        let harness = ready_harness().await;
        harness.engine.push_script(deltas(&["a", "b", "c"]));
        harness.engine.push_script(deltas(&["d", "e"]));

        harness.controller.submit("first").await;
        harness.controller.submit("second").await;

        let snapshots = harness.observer.message_snapshots();
        assert!(!snapshots.is_empty());
        for snapshot in snapshots {
            let streaming = snapshot
                .iter()
                .enumerate()
                .filter(|(_, message)| message.is_streaming)
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            assert!(streaming.len() <= 1);
            if let Some(index) = streaming.first() {
                assert_eq!(*index, snapshot.len() - 1);
                assert!(snapshot[*index].is_assistant());
            }
        }
        let contents = harness
            .controller
            .messages()
            .into_iter()
            .map(|message| message.content)
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["first", "abc", "second", "de"]);
    }

    #[tokio::test]
    async fn user_turn_is_persisted_before_the_first_delta() {
        let harness = ready_harness().await;
        let deltas = harness.engine.push_channel();

        let controller = harness.controller.clone();
        let generation = tokio::spawn(async move { controller.submit("remember me").await });
        wait_until(|| harness.controller.lifecycle_state().is_generating()).await;

        let persisted = persisted_history(&harness.store);
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].content, "remember me");
        assert!(persisted.iter().all(|message| !message.is_streaming));

        deltas.send(Ok("done".to_string())).unwrap();
        drop(deltas);
        assert_eq!(generation.await.unwrap(), Some(GenerationOutcome::Completed));
        assert_eq!(persisted_history(&harness.store).len(), 2);
    }

    #[tokio::test]
    async fn commands_are_rejected_while_generating() {
        let harness = ready_harness().await;
        harness.engine.push_script(deltas(&["earlier"]));
        harness.controller.submit("earlier").await;
        let deltas = harness.engine.push_channel();

        let controller = harness.controller.clone();
        let generation = tokio::spawn(async move { controller.submit("hi").await });
        wait_until(|| harness.controller.lifecycle_state().is_generating()).await;

        assert_eq!(harness.controller.submit("again").await, None);
        assert_eq!(harness.controller.regenerate().await, None);
        assert!(!harness.controller.clear());
        assert!(matches!(
            harness.controller.load_model().await,
            Err(SessionError::Busy { .. })
        ));
        assert!(matches!(
            harness
                .controller
                .import_document(&json!({"version": 1, "messages": []})),
            Err(SessionError::Busy { .. })
        ));
        assert_eq!(harness.engine.init_calls(), 1);
        assert_eq!(harness.controller.messages().len(), 4);

        drop(deltas);
        assert_eq!(generation.await.unwrap(), Some(GenerationOutcome::Completed));
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn regenerate_replaces_the_reply_without_repeating_the_prompt() {
        let harness = harness_with(
            ScriptedEngine::new(),
            MemoryKeyValueStore::with_records([(
                HISTORY_KEY,
                r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]"#,
            )]),
        );
        harness.controller.load_model().await.unwrap();
        harness.engine.push_script(deltas(&["hey there"]));

        let outcome = harness.controller.regenerate().await;

        assert_eq!(outcome, Some(GenerationOutcome::Completed));
        let request = &harness.engine.requests()[0];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1], PromptMessage::new(Role::User, "hi"));

        let messages = harness.controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "hey there");

        // The first rendered snapshot holds the user turn followed by the new placeholder.
        let first = &harness.observer.message_snapshots()[0];
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].content, "hi");
        assert!(first[1].is_streaming);
    }

    #[tokio::test]
    async fn regenerate_needs_a_trailing_reply() {
        let harness = ready_harness().await;
        assert_eq!(harness.controller.regenerate().await, None);

        harness.engine.push_script(StreamScript::OpenFailure("boom".to_string()));
        harness.controller.submit("hi").await;
        // A failed reply is still an assistant turn and may be regenerated.
        harness.engine.push_script(deltas(&["fine"]));
        assert_eq!(
            harness.controller.regenerate().await,
            Some(GenerationOutcome::Completed)
        );
        assert_eq!(harness.controller.messages()[1].content, "fine");
    }

    #[tokio::test]
    async fn empty_custom_model_fails_without_calling_the_engine() {
        let harness = harness();
        harness
            .controller
            .update_settings(|settings| settings.model_id = CUSTOM_MODEL_ID.to_string());

        let result = harness.controller.load_model().await;

        assert!(matches!(result, Err(SessionError::InvalidConfiguration { .. })));
        assert_eq!(harness.engine.init_calls(), 0);
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Unloaded);
        assert_eq!(harness.observer.errors().len(), 1);

        harness
            .controller
            .update_settings(|settings| settings.custom_model_id = "phi3:mini".to_string());
        harness.controller.load_model().await.unwrap();
        assert_eq!(harness.engine.initialized_models(), vec!["phi3:mini".to_string()]);
    }

    #[tokio::test]
    async fn failed_load_moves_to_error_and_can_be_retried() {
        let harness = harness_with(
            ScriptedEngine::new().fail_next_init("out of memory"),
            MemoryKeyValueStore::new(),
        );

        let error = harness.controller.load_model().await.unwrap_err();

        assert!(matches!(error, SessionError::EngineInitialization { .. }));
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Error);
        assert!(harness.controller.loaded_model_id().is_none());
        assert!(harness.controller.last_error().unwrap().contains("out of memory"));
        assert_eq!(harness.controller.submit("hi").await, None);

        harness.controller.load_model().await.unwrap();
        assert_eq!(harness.controller.lifecycle_state(), LifecycleState::Ready);
        assert_eq!(harness.engine.init_calls(), 2);
        assert!(harness.controller.last_error().is_none());

        let states = harness
            .observer
            .statuses()
            .into_iter()
            .map(|(state, _)| state)
            .collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![
                LifecycleState::Loading,
                LifecycleState::Error,
                LifecycleState::Loading,
                LifecycleState::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn progress_is_forwarded_as_reported() {
        let harness = harness_with(
            ScriptedEngine::new().with_progress(vec![0.2, 0.6, 0.4, 1.0]),
            MemoryKeyValueStore::new(),
        );

        harness.controller.load_model().await.unwrap();

        assert_eq!(harness.observer.progress(), vec![0.2, 0.6, 0.4, 1.0]);
    }

    #[tokio::test]
    async fn a_newer_load_supersedes_a_pending_one() {
        let harness = harness_with(
            ScriptedEngine::new().with_init_delay(Duration::from_millis(50)),
            MemoryKeyValueStore::new(),
        );

        let controller = harness.controller.clone();
        let first = tokio::spawn(async move { controller.load_model().await });
        wait_until(|| harness.controller.lifecycle_state() == LifecycleState::Loading).await;

        harness
            .controller
            .update_settings(|settings| settings.model_id = "Phi-3.5-mini-instruct-q4f16_1-MLC".to_string());
        let second = harness.controller.load_model();
        let (first, second) = tokio::join!(first, second);

        first.unwrap().unwrap();
        second.unwrap();
        assert_eq!(harness.engine.init_calls(), 2);
        assert_eq!(
            harness.controller.loaded_model_id().as_deref(),
            Some("Phi-3.5-mini-instruct-q4f16_1-MLC")
        );
    }

    #[tokio::test]
    async fn clear_empties_and_persists_the_history() {
        let harness = ready_harness().await;
        harness.engine.push_script(deltas(&["hello"]));
        harness.controller.submit("hi").await;

        assert!(harness.controller.clear());

        assert!(harness.controller.messages().is_empty());
        assert!(persisted_history(&harness.store).is_empty());
        assert!(harness.observer.message_snapshots().last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failures_do_not_interrupt_the_session() {
        let harness = ready_harness().await;
        harness.store.set_reject_writes(true);
        harness.engine.push_script(deltas(&["still here"]));

        let outcome = harness.controller.submit("hi").await;

        assert_eq!(outcome, Some(GenerationOutcome::Completed));
        assert_eq!(harness.controller.messages().len(), 2);
        assert!(harness.store.get(HISTORY_KEY).unwrap().is_none());
        assert!(harness.observer.errors().is_empty());
    }

    #[tokio::test]
    async fn settings_edits_are_persisted_and_announced() {
        let harness = harness();

        assert_eq!(harness.controller.toggle_theme(), Theme::Light);

        let raw = harness.store.get(SETTINGS_KEY).unwrap().unwrap();
        assert_eq!(Settings::from_persisted(&raw).unwrap().theme, Theme::Light);
        assert_eq!(harness.observer.settings_updates().len(), 1);

        let restarted = SessionController::new(
            harness.engine.clone(),
            harness.store.clone(),
            Arc::new(RecordingObserver::default()),
        );
        assert_eq!(restarted.settings().theme, Theme::Light);
        assert_eq!(restarted.lifecycle_state(), LifecycleState::Unloaded);
    }

    #[tokio::test]
    async fn image_requests_are_flagged_on_completed_replies() {
        let harness = ready_harness().await;
        harness
            .engine
            .push_script(deltas(&["I cannot generate ", "an image, but picture this."]));

        harness.controller.submit("draw a cat").await;

        assert!(harness.controller.messages()[1].has_image_request);
    }

    #[tokio::test]
    async fn malformed_import_leaves_everything_untouched() {
        let harness = ready_harness().await;
        harness.engine.push_script(deltas(&["hello"]));
        harness.controller.submit("hi").await;
        let before = harness.controller.messages();
        let stored_before = harness.store.get(HISTORY_KEY).unwrap();

        let result = harness.controller.import_document(&json!({}));

        assert!(matches!(result, Err(SessionError::MalformedImport { .. })));
        assert_eq!(harness.controller.messages(), before);
        assert_eq!(harness.store.get(HISTORY_KEY).unwrap(), stored_before);
        assert_eq!(harness.observer.errors().len(), 1);

        assert!(matches!(
            harness.controller.import_transcript("{not json"),
            Err(SessionError::MalformedImport { .. })
        ));
        assert_eq!(harness.controller.messages(), before);
    }

    #[tokio::test]
    async fn export_then_import_restores_the_conversation() {
        let source = ready_harness().await;
        source.controller.update_settings(|settings| {
            settings.system_prompt = "Be terse.".to_string();
            settings.temperature = 1.1;
            settings.max_tokens = 64;
            settings.concise_mode = true;
        });
        source.engine.push_script(deltas(&["hello"]));
        source.controller.submit("hi").await;
        let exported = source.controller.export_json().unwrap();

        let target = harness();
        let imported = target.controller.import_transcript(&exported).unwrap();

        assert_eq!(imported, 2);
        assert_eq!(target.controller.messages(), source.controller.messages());
        let settings = target.controller.settings();
        assert_eq!(settings.system_prompt, "Be terse.");
        assert_eq!(settings.temperature, 1.1);
        assert_eq!(settings.max_tokens, 64);
        assert!(settings.concise_mode);
        assert_eq!(persisted_history(&target.store).len(), 2);
        assert!(target.store.get(SETTINGS_KEY).unwrap().is_some());
    }
}
