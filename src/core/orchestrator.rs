//! Orchestrator - Drives the setup pipeline and owns the session lifecycle
//!
//! `Idle -> CheckingRequirements -> ExtractingRuntime* -> LoadingImage* ->
//! StartingContainer -> Ready`, where starred steps are skipped when already
//! satisfied. Once `Ready`, a [`HealthMonitor`] supervises the container until
//! the session is stopped.
//!
//! Every session runs under one [`CancellationToken`]; the health monitor gets
//! a child token so a single `stop()` tears down both before the container is
//! stopped.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::bundle::Bundle;
use super::container::ContainerController;
use super::diagnostics::{DiagnosticReport, DiagnosticsCollector};
use super::error::SetupError;
use super::lifecycle::{LifecycleState, StateKind};
use super::logbuffer::LogBuffer;
use super::monitor::HealthMonitor;
use super::process::CommandRunner;
use super::provision::{ImageProvisioner, ImageRef, ProvisionStep, RuntimeProvisioner};
use super::readiness::{HttpProbe, ReadinessPoller};
use super::recovery::RecoveryCoordinator;
use super::resource::format_bytes;
use super::requirements::{HostProbe, Requirements, SysinfoProbe, SystemRequirementsChecker};
use super::runtime::{CliRuntime, RuntimeAdapter, RuntimePath};
use super::settings::AppConfiguration;
use super::shared::{EngineSnapshot, SharedState};
use super::status::ContainerStatus;
use crate::persistence::Database;

/// Overall progress reached at the end of each step
const REQUIREMENTS_DONE: f64 = 0.1;
const RUNTIME_DONE: f64 = 0.3;
const IMAGE_DONE: f64 = 0.6;

/// Everything the pipeline talks to
pub struct EngineComponents {
    pub checker: Arc<SystemRequirementsChecker>,
    pub runtime_step: Arc<dyn ProvisionStep<Output = RuntimePath>>,
    pub image_step: Arc<dyn ProvisionStep<Output = ImageRef>>,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub controller: Arc<ContainerController>,
    pub poller: Arc<ReadinessPoller>,
    pub host: Arc<dyn HostProbe>,
    pub app_logs: Option<LogBuffer>,
    pub journal: Option<Arc<Database>>,
}

impl EngineComponents {
    /// Real components: the runtime CLI, bundled resources and HTTP readiness
    pub fn standard(
        config: &AppConfiguration,
        journal: Option<Arc<Database>>,
        app_logs: Option<LogBuffer>,
    ) -> Result<Self> {
        let bundle = Bundle::open(config.get_bundle_directory());
        let host: Arc<dyn HostProbe> = Arc::new(SysinfoProbe);
        let checker = SystemRequirementsChecker::new(
            host.clone(),
            Requirements::from_bundle(bundle.requirements()),
            config.get_data_directory(),
        );

        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(CliRuntime::new(
            config.runtime_flavor,
            config.command_timeout(),
            config.image_timeout(),
        ));
        let runtime_step = RuntimeProvisioner::new(
            config.runtime_flavor,
            config.get_runtime_directory(),
            bundle.clone(),
            config.allow_system_runtime,
            CommandRunner::new(config.command_timeout()),
        );
        let image_step = ImageProvisioner::new(
            runtime.clone(),
            config.image.clone(),
            bundle,
            config.allow_registry_pull,
        );
        let probe = HttpProbe::new(config.readiness_request_timeout())
            .context("Failed to build readiness HTTP client")?;

        Ok(Self {
            checker: Arc::new(checker),
            runtime_step: Arc::new(runtime_step),
            image_step: Arc::new(image_step),
            controller: Arc::new(ContainerController::new(runtime.clone())),
            runtime,
            poller: Arc::new(ReadinessPoller::new(Arc::new(probe))),
            host,
            app_logs,
            journal,
        })
    }
}

/// State shared between the orchestrator and its session task
struct Engine {
    config: Arc<AppConfiguration>,
    components: EngineComponents,
    recovery: Arc<RecoveryCoordinator>,
    shared: SharedState,
    monitor_interval: Duration,
}

/// Result of [`Orchestrator::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The pull brought nothing new
    UpToDate,
    /// A new image revision is local; a running service was restarted onto it
    Updated,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    engine: Arc<Engine>,
    session: Mutex<Option<Session>>,
}

impl Orchestrator {
    pub fn new(config: AppConfiguration, components: EngineComponents) -> Self {
        let config = Arc::new(config);
        let mut shared = SharedState::new(config.container_port);
        if let Some(db) = &components.journal {
            shared = shared.with_journal(db.clone());
        }
        let recovery = Arc::new(RecoveryCoordinator::new(
            config.clone(),
            components.controller.clone(),
            components.poller.clone(),
            shared.clone(),
        ));

        Self {
            engine: Arc::new(Engine {
                monitor_interval: config.health_check_interval(),
                config,
                components,
                recovery,
                shared,
            }),
            session: Mutex::new(None),
        }
    }

    /// Override the health check interval taken from the configuration
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        if let Some(engine) = Arc::get_mut(&mut self.engine) {
            engine.monitor_interval = interval;
        }
        self
    }

    pub fn config(&self) -> &AppConfiguration {
        &self.engine.config
    }

    pub fn shared(&self) -> &SharedState {
        &self.engine.shared
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.engine.shared.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.engine.shared.subscribe()
    }

    /// Recovery attempts made over the orchestrator's lifetime
    pub fn recovery_attempts(&self) -> u32 {
        self.engine.recovery.attempts()
    }

    /// Run the pipeline in a new session. Returns false if a session is
    /// already running.
    pub async fn start(&self) -> bool {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            // A session that just failed may still be unwinding
            let settled = matches!(
                self.engine.shared.state(),
                LifecycleState::Error(_) | LifecycleState::Stopped
            );
            if !settled && !previous.task.is_finished() {
                warn!("Start ignored: a session is already running");
                *session = Some(previous);
                return false;
            }
            previous.cancel.cancel();
            if let Err(e) = previous.task.await {
                warn!("Previous session task ended abnormally: {}", e);
            }
        }

        if !self.engine.shared.transition(LifecycleState::CheckingRequirements) {
            return false;
        }
        self.engine.shared.set_progress(0.0);

        let cancel = CancellationToken::new();
        let engine = self.engine.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { engine.run_session(token).await });

        *session = Some(Session { cancel, task });
        true
    }

    /// Cancel the session, then stop and remove the container
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(Session { cancel, task }) = session.take() {
            // Monitor and in-flight step go down before the container does
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        let config = &self.engine.config;
        self.engine
            .components
            .controller
            .stop(&config.container_name)
            .await;

        let shared = &self.engine.shared;
        shared.set_container_status(ContainerStatus::stopped(config.container_port));
        shared.set_monitor_active(false);
        shared.transition(LifecycleState::Stopped);
    }

    /// Stop whatever is running and re-enter the pipeline from the start
    pub async fn restart(&self) -> bool {
        info!("Restarting");
        self.stop().await;
        self.start().await
    }

    /// Pull the configured image and move the service onto it.
    ///
    /// The session is left alone when the pull fails or brings nothing new.
    pub async fn update(&self) -> Result<UpdateOutcome, SetupError> {
        let image = &self.engine.config.image;
        let components = &self.engine.components;
        if let Some(runtime) = components.runtime_step.existing().await? {
            components.runtime.use_runtime(&runtime);
        }

        let before = current_image_id(components.runtime.as_ref(), image).await;
        info!("Checking {} for a newer revision", image);
        components
            .runtime
            .pull_image(image)
            .await
            .map_err(|e| SetupError::from_pull_failure(&e, image))?;
        let after = current_image_id(components.runtime.as_ref(), image).await;

        if before.is_some() && before == after {
            info!("{} is up to date", image);
            return Ok(UpdateOutcome::UpToDate);
        }
        info!("Pulled a new revision of {}", image);
        if self.engine.shared.state().is_monitored() {
            self.restart().await;
        }
        Ok(UpdateOutcome::Updated)
    }

    /// Stop the service, remove its container and delete the data it owns.
    ///
    /// The volume and the managed runtime go; the database and logs stay with
    /// the host process.
    pub async fn uninstall(&self) -> Result<(), SetupError> {
        info!("Uninstalling {}", self.engine.config.container_name);
        self.stop().await;
        remove_tree(&self.engine.config.get_volume_directory()).await?;
        remove_tree(&self.engine.config.get_runtime_directory()).await?;
        Ok(())
    }

    /// Wait for the pipeline to reach `Ready`, `Stopped` or `Error`
    pub async fn wait_until_settled(&self) -> LifecycleState {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(snapshot) => snapshot.state.clone(),
            Err(_) => self.engine.shared.state(),
        };
        settled
    }

    pub fn diagnostics(&self) -> DiagnosticsCollector {
        let engine = &self.engine;
        let collector = DiagnosticsCollector::new(
            engine.config.clone(),
            engine.components.controller.clone(),
            engine.shared.clone(),
            engine.components.host.clone(),
        );
        match &engine.components.app_logs {
            Some(buffer) => collector.with_app_logs(buffer.clone()),
            None => collector,
        }
    }

    pub async fn collect_diagnostics(&self) -> DiagnosticReport {
        self.diagnostics().collect().await
    }
}

impl Engine {
    async fn run_session(&self, cancel: CancellationToken) {
        match self.run_pipeline(&cancel).await {
            Ok(()) => {
                let monitor = HealthMonitor::new(
                    self.config.clone(),
                    self.components.controller.clone(),
                    self.recovery.clone(),
                    self.shared.clone(),
                )
                .with_interval(self.monitor_interval);
                if let Err(e) = monitor.spawn(cancel.child_token()).await {
                    warn!("Health monitor task ended abnormally: {}", e);
                }
            }
            Err(SetupError::Cancelled) => info!("Setup cancelled"),
            Err(_) if cancel.is_cancelled() => info!("Setup cancelled"),
            Err(e) => {
                error!("Setup failed: {}", e);
                self.shared.fail(e);
            }
        }
    }

    async fn run_pipeline(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        let shared = &self.shared;
        let components = &self.components;

        let checker = components.checker.clone();
        let facts = cancellable(cancel, async move {
            tokio::task::spawn_blocking(move || checker.check())
                .await
                .map_err(|e| SetupError::Unknown(format!("requirements check aborted: {}", e)))?
        })
        .await?;
        info!(
            "Host ok: {} {} ({}), {} memory, {} free",
            facts.os_family,
            facts.os_version.as_deref().unwrap_or("?"),
            facts.architecture,
            format_bytes(facts.total_memory),
            format_bytes(facts.available_disk_space)
        );
        shared.set_progress(REQUIREMENTS_DONE);

        let runtime = match cancellable(cancel, components.runtime_step.existing()).await? {
            Some(runtime) => {
                info!("Using runtime at {:?}", runtime.path);
                runtime
            }
            None => {
                shared.transition(LifecycleState::ExtractingRuntime(0.0));
                let progress = step_reporter(
                    shared.clone(),
                    StateKind::ExtractingRuntime,
                    (REQUIREMENTS_DONE, RUNTIME_DONE),
                    LifecycleState::ExtractingRuntime,
                );
                cancellable(cancel, components.runtime_step.provision(&progress)).await?
            }
        };
        components.runtime.use_runtime(&runtime);
        shared.set_progress(RUNTIME_DONE);

        let image = match cancellable(cancel, components.image_step.existing()).await? {
            Some(image) => image,
            None => {
                shared.transition(LifecycleState::LoadingImage(0.0));
                let progress = step_reporter(
                    shared.clone(),
                    StateKind::LoadingImage,
                    (RUNTIME_DONE, IMAGE_DONE),
                    LifecycleState::LoadingImage,
                );
                cancellable(cancel, components.image_step.provision(&progress)).await?
            }
        };
        info!("Image {} available ({:?})", image.name, image.source);
        shared.set_progress(IMAGE_DONE);

        shared.transition(LifecycleState::StartingContainer(0.0));
        let handle = cancellable(cancel, components.controller.start(&self.config)).await?;
        let progress = step_reporter(
            shared.clone(),
            StateKind::StartingContainer,
            (IMAGE_DONE, 1.0),
            LifecycleState::StartingContainer,
        );
        components
            .poller
            .wait_until_ready(
                handle.port,
                self.config.readiness_max_attempts,
                self.config.readiness_interval(),
                &progress,
                cancel,
            )
            .await?;

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SetupError::Cancelled),
            status = components.controller.status(&self.config) => status,
        };
        match status {
            Ok(status) => shared.set_container_status(status),
            Err(e) => warn!("Could not read status of {}: {}", handle.name, e),
        }

        if !shared.transition_when(|s| s.kind() == StateKind::StartingContainer, LifecycleState::Ready) {
            return Err(SetupError::Cancelled);
        }
        shared.set_progress(1.0);
        info!("Service ready at {}", self.config.service_url());
        Ok(())
    }
}

async fn current_image_id(runtime: &dyn RuntimeAdapter, image: &str) -> Option<String> {
    match runtime.image_id(image).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Could not inspect {}: {}", image, e.detail());
            None
        }
    }
}

/// Delete a directory tree; one that is already gone is fine
async fn remove_tree(path: &Path) -> Result<(), SetupError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!("Removed {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(SetupError::PermissionDenied(
            format!("{}: {}", path.display(), e),
        )),
        Err(e) => Err(SetupError::Unknown(format!(
            "could not remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Run `step` unless the session is cancelled first
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T, SetupError>>,
) -> Result<T, SetupError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SetupError::Cancelled),
        result = step => result,
    }
}

/// Map a step's own `[0, 1]` progress onto its state and overall band
fn step_reporter(
    shared: SharedState,
    kind: StateKind,
    band: (f64, f64),
    state: fn(f64) -> LifecycleState,
) -> impl Fn(f64) + Send + Sync {
    move |p: f64| {
        let p = p.clamp(0.0, 1.0);
        if shared.transition_when(|s| s.kind() == kind, state(p)) {
            shared.set_progress(band.0 + (band.1 - band.0) * p);
        }
    }
}
