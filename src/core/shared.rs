//! Shared engine state - Single-writer lifecycle state published to observers
//!
//! The pipeline, the health monitor and the recovery coordinator all write
//! through [`SharedState`]; every write happens under one mutex and the new
//! snapshot is broadcast on a watch channel.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::error::SetupError;
use super::lifecycle::{LifecycleState, StateKind};
use super::status::ContainerStatus;
use crate::persistence::Database;

/// Everything an observer can see about the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub state: LifecycleState,
    /// Overall setup progress in `[0, 1]`
    pub setup_progress: f64,
    pub container_status: ContainerStatus,
    #[serde(skip)]
    pub last_error: Option<SetupError>,
    pub monitor_active: bool,
}

struct EngineState {
    snapshot: EngineSnapshot,
    visited: Vec<StateKind>,
}

/// Cloneable handle to the engine's state
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<EngineState>>,
    publisher: Arc<watch::Sender<EngineSnapshot>>,
    journal: Option<Arc<Database>>,
    session_id: String,
}

impl SharedState {
    pub fn new(port: u16) -> Self {
        let snapshot = EngineSnapshot {
            state: LifecycleState::Idle,
            setup_progress: 0.0,
            container_status: ContainerStatus::unknown(port),
            last_error: None,
            monitor_active: false,
        };
        let (publisher, _) = watch::channel(snapshot.clone());
        Self {
            inner: Arc::new(Mutex::new(EngineState {
                snapshot,
                visited: Vec::new(),
            })),
            publisher: Arc::new(publisher),
            journal: None,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Record every state change in the lifecycle history table
    pub fn with_journal(mut self, db: Arc<Database>) -> Self {
        self.journal = Some(db);
        self
    }

    pub fn journal(&self) -> Option<&Arc<Database>> {
        self.journal.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // Updates are plain assignments; a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().snapshot.state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.publisher.subscribe()
    }

    /// State kinds entered so far, consecutive repeats collapsed
    pub fn visited(&self) -> Vec<StateKind> {
        self.lock().visited.clone()
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&self, next: LifecycleState) -> bool {
        self.transition_when(|_| true, next)
    }

    /// Move to `next` only while the current state satisfies `guard`
    pub fn transition_when(
        &self,
        guard: impl FnOnce(&LifecycleState) -> bool,
        next: LifecycleState,
    ) -> bool {
        self.apply(guard, next, None)
    }

    /// Enter `Error` with the translated message, keeping the structured error
    pub fn fail(&self, error: SetupError) -> bool {
        let message = error.user_message();
        self.fail_with(error, message)
    }

    /// Enter `Error` with a custom message
    pub fn fail_with(&self, error: SetupError, message: String) -> bool {
        self.apply(|_| true, LifecycleState::Error(message), Some(error))
    }

    fn apply(
        &self,
        guard: impl FnOnce(&LifecycleState) -> bool,
        next: LifecycleState,
        error: Option<SetupError>,
    ) -> bool {
        let (from, snapshot) = {
            let mut state = self.lock();
            let current = state.snapshot.state.clone();
            if !guard(&current) {
                return false;
            }
            if !current.kind().can_transition_to(next.kind()) {
                warn!("Ignoring illegal transition {} -> {}", current, next);
                return false;
            }
            if current.kind() != next.kind() {
                state.visited.push(next.kind());
            }
            state.snapshot.last_error = error;
            state.snapshot.state = next.clone();
            (current, state.snapshot.clone())
        };

        self.publisher.send_replace(snapshot);

        if from.kind() != next.kind() {
            info!("Lifecycle: {} -> {}", from.label(), next);
            self.record(&from, &next);
        }
        true
    }

    pub fn set_progress(&self, progress: f64) {
        self.update(|s| s.setup_progress = progress.clamp(0.0, 1.0));
    }

    pub fn set_container_status(&self, status: ContainerStatus) {
        self.update(|s| s.container_status = status);
    }

    pub fn set_monitor_active(&self, active: bool) {
        self.update(|s| s.monitor_active = active);
    }

    fn update(&self, apply: impl FnOnce(&mut EngineSnapshot)) {
        let snapshot = {
            let mut state = self.lock();
            apply(&mut state.snapshot);
            state.snapshot.clone()
        };
        self.publisher.send_replace(snapshot);
    }

    fn record(&self, from: &LifecycleState, to: &LifecycleState) {
        let Some(db) = &self.journal else {
            return;
        };
        let detail = to.error_message();
        if let Err(e) = db.record_transition(&self.session_id, from.label(), to.label(), detail) {
            warn!("Failed to journal lifecycle transition: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_are_published() {
        let shared = SharedState::new(3000);
        let rx = shared.subscribe();

        assert!(shared.transition(LifecycleState::CheckingRequirements));
        assert!(shared.transition(LifecycleState::StartingContainer(0.0)));
        assert!(shared.transition(LifecycleState::StartingContainer(0.5)));
        assert!(shared.transition(LifecycleState::Ready));

        assert_eq!(rx.borrow().state, LifecycleState::Ready);
        assert_eq!(
            shared.visited(),
            vec![
                StateKind::CheckingRequirements,
                StateKind::StartingContainer,
                StateKind::Ready
            ]
        );
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let shared = SharedState::new(3000);
        assert!(!shared.transition(LifecycleState::Ready));
        assert_eq!(shared.state(), LifecycleState::Idle);
        assert!(shared.visited().is_empty());
    }

    #[test]
    fn guarded_transition_respects_current_state() {
        let shared = SharedState::new(3000);
        shared.transition(LifecycleState::Stopped);
        assert!(!shared.transition_when(|s| s.is_monitored(), LifecycleState::Degraded));
        assert_eq!(shared.state(), LifecycleState::Stopped);
    }

    #[test]
    fn failure_keeps_translated_message_and_error() {
        let shared = SharedState::new(3000);
        shared.transition(LifecycleState::CheckingRequirements);
        shared.fail(SetupError::PortUnavailable(3000));

        let snapshot = shared.snapshot();
        assert!(snapshot
            .state
            .error_message()
            .unwrap()
            .contains("Port 3000 is already in use"));
        assert_eq!(snapshot.last_error, Some(SetupError::PortUnavailable(3000)));

        shared.transition(LifecycleState::CheckingRequirements);
        assert_eq!(shared.snapshot().last_error, None);
    }

    #[test]
    fn transitions_are_journaled() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let shared = SharedState::new(3000).with_journal(db.clone());

        shared.transition(LifecycleState::CheckingRequirements);
        shared.transition(LifecycleState::ExtractingRuntime(0.1));
        shared.transition(LifecycleState::ExtractingRuntime(0.9));
        shared.transition(LifecycleState::Stopped);

        let history = db.recent_history(10).unwrap();
        let targets: Vec<_> = history.iter().map(|h| h.to_state.as_str()).collect();
        assert_eq!(targets, vec!["Checking requirements", "Extracting runtime", "Stopped"]);
        assert!(history.iter().all(|h| h.session_id == shared.session_id()));
    }
}
