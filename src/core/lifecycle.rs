//! Lifecycle state - The engine's single state machine value

use serde::{Deserialize, Serialize};

/// Current phase of the engine. Progress values are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "detail")]
pub enum LifecycleState {
    #[default]
    Idle,
    CheckingRequirements,
    ExtractingRuntime(f64),
    LoadingImage(f64),
    StartingContainer(f64),
    Ready,
    Degraded,
    Recovering,
    Stopped,
    Error(String),
}

/// Variant of a [`LifecycleState`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Idle,
    CheckingRequirements,
    ExtractingRuntime,
    LoadingImage,
    StartingContainer,
    Ready,
    Degraded,
    Recovering,
    Stopped,
    Error,
}

impl StateKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::CheckingRequirements => "Checking requirements",
            Self::ExtractingRuntime => "Extracting runtime",
            Self::LoadingImage => "Loading image",
            Self::StartingContainer => "Starting container",
            Self::Ready => "Ready",
            Self::Degraded => "Degraded",
            Self::Recovering => "Recovering",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }

    /// Position along the happy path, used to reject backwards moves
    fn pipeline_rank(&self) -> Option<u8> {
        match self {
            Self::Idle => Some(0),
            Self::CheckingRequirements => Some(1),
            Self::ExtractingRuntime => Some(2),
            Self::LoadingImage => Some(3),
            Self::StartingContainer => Some(4),
            Self::Ready => Some(5),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// The happy path only moves forward. Earlier states are re-entered
    /// through `Recovering -> StartingContainer`, or by a restart from a
    /// terminal state back to `CheckingRequirements`.
    pub fn can_transition_to(&self, next: StateKind) -> bool {
        use StateKind::*;

        // Stop and failure are reachable from anywhere
        if matches!(next, Stopped | Error) {
            return true;
        }

        match (self, next) {
            (Stopped | Error, CheckingRequirements) => true,
            (Ready | Degraded, Degraded | Ready | Recovering) => true,
            (Recovering, StartingContainer) => true,
            (Stopped | Error | Recovering | Degraded, _) => false,
            (from, to) => match (from.pipeline_rank(), to.pipeline_rank()) {
                (Some(a), Some(b)) => b >= a && !(a == 0 && b > 1),
                _ => false,
            },
        }
    }
}

impl LifecycleState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Idle => StateKind::Idle,
            Self::CheckingRequirements => StateKind::CheckingRequirements,
            Self::ExtractingRuntime(_) => StateKind::ExtractingRuntime,
            Self::LoadingImage(_) => StateKind::LoadingImage,
            Self::StartingContainer(_) => StateKind::StartingContainer,
            Self::Ready => StateKind::Ready,
            Self::Degraded => StateKind::Degraded,
            Self::Recovering => StateKind::Recovering,
            Self::Stopped => StateKind::Stopped,
            Self::Error(_) => StateKind::Error,
        }
    }

    pub fn label(&self) -> &'static str {
        self.kind().label()
    }

    /// Step progress carried by provisioning states
    pub fn step_progress(&self) -> Option<f64> {
        match self {
            Self::ExtractingRuntime(p) | Self::LoadingImage(p) | Self::StartingContainer(p) => {
                Some(*p)
            }
            _ => None,
        }
    }

    /// States the HealthMonitor runs in
    pub fn is_monitored(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// States the pipeline settles in
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Stopped | Self::Error(_))
    }

    /// Whether a retry (restart) should be offered
    pub fn allows_retry(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Stopped | Self::Degraded)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Human-readable description including progress
    pub fn describe(&self) -> String {
        match self {
            Self::Error(message) => format!("Error: {}", message),
            other => match other.step_progress() {
                Some(p) => format!("{} ({:.0}%)", other.label(), p * 100.0),
                None => other.label().to_string(),
            },
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}
