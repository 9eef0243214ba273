//! Test doubles for the engine and observer seams.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use hearth_llm::{
    BoxFuture, CompletionRequest, DeltaStream, EngineError, EngineHandle, EngineResult,
    InferenceEngine, ProgressSink,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::chat::{LifecycleState, Message, SessionObserver};
use crate::settings::Settings;

pub(crate) enum StreamScript {
    Deltas(Vec<EngineResult<String>>),
    OpenFailure(String),
    Channel(mpsc::UnboundedReceiver<EngineResult<String>>),
    /// Runs `on_end` when the stream is polled past its last delta.
    ThenRun(Vec<EngineResult<String>>, Box<dyn FnOnce() + Send>),
}

/// Engine whose replies are queued up front. An empty queue yields an empty reply.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    init_calls: AtomicUsize,
    init_failures: Mutex<VecDeque<String>>,
    init_delay: Option<Duration>,
    initialized: Mutex<Vec<String>>,
    progress_steps: Vec<f64>,
    scripts: Arc<Mutex<VecDeque<StreamScript>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_progress(mut self, steps: Vec<f64>) -> Self {
        self.progress_steps = steps;
        self
    }

    pub(crate) fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub(crate) fn fail_next_init(self, message: &str) -> Self {
        self.init_failures.lock().push_back(message.to_string());
        self
    }

    pub(crate) fn push_script(&self, script: StreamScript) {
        self.scripts.lock().push_back(script);
    }

    /// Queues a reply fed by hand; dropping the sender ends it.
    pub(crate) fn push_channel(&self) -> mpsc::UnboundedSender<EngineResult<String>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.push_script(StreamScript::Channel(receiver));
        sender
    }

    pub(crate) fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn initialized_models(&self) -> Vec<String> {
        self.initialized.lock().clone()
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn initialize<'a>(
        &'a self,
        model_id: &'a str,
        progress: ProgressSink,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn EngineHandle>>> {
        Box::pin(async move {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            for step in &self.progress_steps {
                progress(*step);
            }
            if let Some(delay) = self.init_delay {
                tokio::time::sleep(delay).await;
            }

            let failure = self.init_failures.lock().pop_front();
            if let Some(message) = failure {
                return Err(EngineError::engine("scripted-initialize", message));
            }

            self.initialized.lock().push(model_id.to_string());
            let handle: Arc<dyn EngineHandle> = Arc::new(ScriptedHandle {
                model_id: model_id.to_string(),
                scripts: Arc::clone(&self.scripts),
                requests: Arc::clone(&self.requests),
            });
            Ok(handle)
        })
    }
}

struct ScriptedHandle {
    model_id: String,
    scripts: Arc<Mutex<VecDeque<StreamScript>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl EngineHandle for ScriptedHandle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, EngineResult<DeltaStream>> {
        Box::pin(async move {
            self.requests.lock().push(request);
            let script = self.scripts.lock().pop_front();
            match script {
                None => Ok(futures::stream::empty().boxed()),
                Some(StreamScript::Deltas(items)) => Ok(futures::stream::iter(items).boxed()),
                Some(StreamScript::OpenFailure(message)) => {
                    Err(EngineError::engine("scripted-open", message))
                }
                Some(StreamScript::Channel(receiver)) => Ok(futures::stream::unfold(
                    receiver,
                    |mut receiver| async move { receiver.recv().await.map(|item| (item, receiver)) },
                )
                .boxed()),
                Some(StreamScript::ThenRun(items, on_end)) => {
                    let mut on_end = Some(on_end);
                    let tail = futures::stream::poll_fn(move |_| {
                        if let Some(on_end) = on_end.take() {
                            on_end();
                        }
                        std::task::Poll::Ready(None)
                    });
                    Ok(futures::stream::iter(items).chain(tail).boxed())
                }
            }
        })
    }
}

/// Observer that keeps every notification for later assertions.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    messages: Mutex<Vec<Vec<Message>>>,
    statuses: Mutex<Vec<(LifecycleState, Option<String>)>>,
    progress: Mutex<Vec<f64>>,
    errors: Mutex<Vec<String>>,
    settings: Mutex<Vec<Settings>>,
}

impl RecordingObserver {
    pub(crate) fn message_snapshots(&self) -> Vec<Vec<Message>> {
        self.messages.lock().clone()
    }

    pub(crate) fn statuses(&self) -> Vec<(LifecycleState, Option<String>)> {
        self.statuses.lock().clone()
    }

    pub(crate) fn progress(&self) -> Vec<f64> {
        self.progress.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub(crate) fn settings_updates(&self) -> Vec<Settings> {
        self.settings.lock().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_messages_changed(&self, messages: &[Message]) {
        self.messages.lock().push(messages.to_vec());
    }

    fn on_status_changed(&self, state: LifecycleState, detail: Option<&str>) {
        self.statuses
            .lock()
            .push((state, detail.map(str::to_string)));
    }

    fn on_progress(&self, fraction: f64) {
        self.progress.lock().push(fraction);
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn on_settings_changed(&self, settings: &Settings) {
        self.settings.lock().push(settings.clone());
    }
}

/// Yields to other tasks until `condition` holds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
