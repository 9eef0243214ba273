use std::fmt;

/// Model and generation lifecycle of one session. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Generating,
    Error,
}

/// State transition input for the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTransition {
    LoadRequested,
    EngineReady,
    EngineFailed,
    GenerationStarted,
    GenerationFinished,
}

/// Rejection reason for illegal lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    Busy,
    NotLoading(LifecycleState),
    NotReady(LifecycleState),
    NotGenerating(LifecycleState),
}

pub type TransitionResult = Result<LifecycleState, TransitionRejection>;

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Error => "error",
        }
    }

    /// Whether the send affordance should be enabled.
    pub fn accepts_input(self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_generating(self) -> bool {
        matches!(self, Self::Generating)
    }

    /// Applies one transition deterministically.
    ///
    /// Loading may start from anywhere except `Generating`; a second load while
    /// `Loading` restarts it. Generation failures return to `Ready`, never `Error`.
    pub fn apply(self, transition: LifecycleTransition) -> TransitionResult {
        match (self, transition) {
            (Self::Generating, LifecycleTransition::LoadRequested) => {
                Err(TransitionRejection::Busy)
            }
            (_, LifecycleTransition::LoadRequested) => Ok(Self::Loading),
            (Self::Loading, LifecycleTransition::EngineReady) => Ok(Self::Ready),
            (Self::Loading, LifecycleTransition::EngineFailed) => Ok(Self::Error),
            (state, LifecycleTransition::EngineReady | LifecycleTransition::EngineFailed) => {
                Err(TransitionRejection::NotLoading(state))
            }
            (Self::Ready, LifecycleTransition::GenerationStarted) => Ok(Self::Generating),
            (state, LifecycleTransition::GenerationStarted) => {
                Err(TransitionRejection::NotReady(state))
            }
            (Self::Generating, LifecycleTransition::GenerationFinished) => Ok(Self::Ready),
            (state, LifecycleTransition::GenerationFinished) => {
                Err(TransitionRejection::NotGenerating(state))
            }
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
