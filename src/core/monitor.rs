//! Health monitoring - Periodic container checks while the service is up
//!
//! Runs only while the engine is `Ready` or `Degraded`. Each running to
//! stopped edge triggers exactly one recovery. A successful recovery counts as
//! seeing the container running again, so a later crash is caught as well.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::container::ContainerController;
use super::lifecycle::LifecycleState;
use super::recovery::{RecoveryCoordinator, RecoveryOutcome};
use super::settings::AppConfiguration;
use super::shared::SharedState;
use super::status::HealthStatus;

pub struct HealthMonitor {
    config: Arc<AppConfiguration>,
    controller: Arc<ContainerController>,
    recovery: Arc<RecoveryCoordinator>,
    shared: SharedState,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<AppConfiguration>,
        controller: Arc<ContainerController>,
        recovery: Arc<RecoveryCoordinator>,
        shared: SharedState,
    ) -> Self {
        Self {
            interval: config.health_check_interval(),
            config,
            controller,
            recovery,
            shared,
        }
    }

    /// Override the check interval taken from the configuration
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the periodic task; it ends when `cancel` fires or the engine
    /// leaves the monitored states
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        self.shared.set_monitor_active(true);
        tokio::spawn(async move {
            self.run(&cancel).await;
            self.shared.set_monitor_active(false);
        })
    }

    async fn run(&self, cancel: &CancellationToken) {
        info!("Health monitor started (every {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.shared.state().is_monitored() {
                break;
            }

            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                status = self.controller.status(&self.config) => status,
            };
            // A stop may have landed while the query was in flight
            if cancel.is_cancelled() {
                break;
            }

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!("Health check could not query the runtime: {}", e);
                    continue;
                }
            };
            debug!(
                "Health check: running={} health={}",
                status.is_running,
                status.health.label()
            );
            let running = status.is_running;
            let unhealthy = status.health == HealthStatus::Unhealthy;
            self.shared.set_container_status(status);

            if running {
                let next = if unhealthy {
                    LifecycleState::Degraded
                } else {
                    LifecycleState::Ready
                };
                let kind = next.kind();
                self.shared
                    .transition_when(move |s| s.is_monitored() && s.kind() != kind, next);
                continue;
            }

            self.shared.set_monitor_active(false);
            match self.recovery.attempt_recovery(cancel).await {
                // The recovered container answered, so the next stop is a new edge
                RecoveryOutcome::Recovered => self.shared.set_monitor_active(true),
                RecoveryOutcome::Failed(_) | RecoveryOutcome::Cancelled => break,
            }
        }

        info!("Health monitor stopped");
    }
}
