mod engine;
mod model;
mod rig_adapter;

pub use engine::{
    BoxFuture, CompletionRequest, DeltaStream, EngineError, EngineHandle, EngineResult,
    InferenceEngine, ProgressSink, PromptMessage, Role,
};
pub use model::{CUSTOM_MODEL_ID, DEFAULT_MODEL_ID, Model, builtin_models};
pub use rig_adapter::{DEFAULT_API_KEY, DEFAULT_ENDPOINT, RigEngine, RigEngineConfig};
