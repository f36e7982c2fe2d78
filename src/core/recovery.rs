//! Recovery coordinator - One bounded restart per detected failure

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::container::ContainerController;
use super::error::SetupError;
use super::lifecycle::{LifecycleState, StateKind};
use super::readiness::ReadinessPoller;
use super::settings::AppConfiguration;
use super::shared::SharedState;

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Recovered,
    Failed(String),
    /// Stop was requested, or the engine left the monitored states first
    Cancelled,
}

pub struct RecoveryCoordinator {
    config: Arc<AppConfiguration>,
    controller: Arc<ContainerController>,
    poller: Arc<ReadinessPoller>,
    shared: SharedState,
    attempts: AtomicU32,
}

impl RecoveryCoordinator {
    pub fn new(
        config: Arc<AppConfiguration>,
        controller: Arc<ContainerController>,
        poller: Arc<ReadinessPoller>,
        shared: SharedState,
    ) -> Self {
        Self {
            config,
            controller,
            poller,
            shared,
            attempts: AtomicU32::new(0),
        }
    }

    /// Recovery attempts made since the coordinator was created
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Restart the container once and wait for it with the shorter recovery budget
    pub async fn attempt_recovery(&self, cancel: &CancellationToken) -> RecoveryOutcome {
        if !self
            .shared
            .transition_when(|s| s.is_monitored(), LifecycleState::Recovering)
        {
            return RecoveryOutcome::Cancelled;
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        warn!(
            "Container {} stopped unexpectedly, attempting recovery",
            self.config.container_name
        );

        match self.restart(cancel).await {
            Ok(polls) => {
                if !self.shared.transition_when(
                    |s| s.kind() == StateKind::StartingContainer,
                    LifecycleState::Ready,
                ) {
                    return RecoveryOutcome::Cancelled;
                }
                info!("Recovery succeeded after {} readiness poll(s)", polls);
                RecoveryOutcome::Recovered
            }
            Err(SetupError::Cancelled) => RecoveryOutcome::Cancelled,
            Err(e) => {
                error!("Automatic recovery failed: {}", e);
                let message = format!(
                    "Automatic recovery failed: {} Restart the service to try again.",
                    e.user_message()
                );
                self.shared.fail_with(e, message.clone());
                RecoveryOutcome::Failed(message)
            }
        }
    }

    async fn restart(&self, cancel: &CancellationToken) -> Result<u32, SetupError> {
        self.shared.transition(LifecycleState::StartingContainer(0.0));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SetupError::Cancelled),
            started = self.controller.start(&self.config) => { started?; }
        }

        let shared = self.shared.clone();
        let progress = move |p: f64| {
            shared.transition_when(
                |s| s.kind() == StateKind::StartingContainer,
                LifecycleState::StartingContainer(p),
            );
        };
        self.poller
            .wait_until_ready(
                self.config.container_port,
                self.config.recovery_max_attempts,
                self.config.readiness_interval(),
                &progress,
                cancel,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{FakeRuntime, ScriptedProbe};

    fn coordinator(
        runtime: Arc<FakeRuntime>,
        probe: Arc<ScriptedProbe>,
        data_dir: &std::path::Path,
    ) -> (RecoveryCoordinator, SharedState) {
        let config = Arc::new(AppConfiguration {
            data_directory: Some(data_dir.to_path_buf()),
            readiness_interval_ms: 10,
            recovery_max_attempts: 3,
            ..Default::default()
        });
        let shared = SharedState::new(config.container_port);
        shared.transition(LifecycleState::CheckingRequirements);
        shared.transition(LifecycleState::StartingContainer(0.0));
        shared.transition(LifecycleState::Ready);

        let coordinator = RecoveryCoordinator::new(
            config,
            Arc::new(ContainerController::new(runtime)),
            Arc::new(ReadinessPoller::new(probe)),
            shared.clone(),
        );
        (coordinator, shared)
    }

    #[tokio::test]
    async fn successful_recovery_returns_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (coordinator, shared) =
            coordinator(runtime.clone(), Arc::new(ScriptedProbe::always(200)), dir.path());

        let outcome = coordinator.attempt_recovery(&CancellationToken::new()).await;

        assert_eq!(outcome, RecoveryOutcome::Recovered);
        assert_eq!(shared.state(), LifecycleState::Ready);
        assert_eq!(runtime.run_calls(), 1);
        assert_eq!(coordinator.attempts(), 1);
        assert!(shared.visited().ends_with(&[
            StateKind::Recovering,
            StateKind::StartingContainer,
            StateKind::Ready
        ]));
    }

    #[tokio::test]
    async fn failed_recovery_escalates_once() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(ScriptedProbe::always(502));
        let (coordinator, shared) = coordinator(runtime, probe.clone(), dir.path());

        let outcome = coordinator.attempt_recovery(&CancellationToken::new()).await;

        match outcome {
            RecoveryOutcome::Failed(message) => assert!(message.contains("Automatic recovery failed")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probe.calls(), 3);
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.state.kind(), StateKind::Error);
        assert_eq!(snapshot.last_error, Some(SetupError::ContainerNotReady { attempts: 3 }));

        // Error is not monitored, so nothing further happens
        let again = coordinator.attempt_recovery(&CancellationToken::new()).await;
        assert_eq!(again, RecoveryOutcome::Cancelled);
        assert_eq!(coordinator.attempts(), 1);
    }

    #[tokio::test]
    async fn cancelled_recovery_does_not_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (coordinator, shared) =
            coordinator(runtime, Arc::new(ScriptedProbe::always(503)), dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(coordinator.attempt_recovery(&cancel).await, RecoveryOutcome::Cancelled);
        assert_ne!(shared.state().kind(), StateKind::Error);
    }
}
