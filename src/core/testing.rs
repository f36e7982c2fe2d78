//! Test doubles for the engine's seams

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::error::{RuntimeError, SetupError};
use super::provision::{ProgressFn, ProvisionStep};
use super::readiness::ReadinessProbe;
use super::requirements::HostProbe;
use super::resource::{GIB, MIB};
use super::runtime::{ContainerEntry, ResourceSample, RunSpec, RuntimeAdapter, RuntimePath, RuntimeSource};
use super::settings::RuntimeFlavor;
use super::shared::SharedState;

fn failed(command: &str, stderr: &str) -> RuntimeError {
    RuntimeError::Failed {
        command: command.to_string(),
        code: Some(125),
        stderr: stderr.to_string(),
    }
}

#[derive(Default)]
struct FakeContainer {
    name: String,
    image: String,
    running: bool,
}

#[derive(Default)]
struct FakeState {
    images: Vec<String>,
    loadable_image: Option<String>,
    pull_error: Option<String>,
    run_errors: VecDeque<String>,
    run_delay: Option<Duration>,
    local_revision: u32,
    remote_revision: u32,
    health_text: Option<String>,
    container: Option<FakeContainer>,
    logs: Vec<String>,
    logs_error: Option<String>,
    last_spec: Option<RunSpec>,
    runtime_path: Option<PathBuf>,
}

/// Scripted in-memory container runtime
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    load_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    run_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_images(images: &[&str]) -> Self {
        let runtime = Self::new();
        runtime.state().images = images.iter().map(|i| i.to_string()).collect();
        runtime
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Image that appears in the listing after a successful `load`
    pub fn set_loadable_image(&self, image: &str) {
        self.state().loadable_image = Some(image.to_string());
    }

    pub fn fail_pull(&self, stderr: &str) {
        self.state().pull_error = Some(stderr.to_string());
    }

    pub fn fail_next_run(&self, stderr: &str) {
        self.state().run_errors.push_back(stderr.to_string());
    }

    pub fn set_run_delay(&self, delay: Duration) {
        self.state().run_delay = Some(delay);
    }

    /// Make the next pull bring a new image revision
    pub fn publish_update(&self) {
        self.state().remote_revision += 1;
    }

    /// Status column reported for a running container
    pub fn set_health_text(&self, text: &str) {
        self.state().health_text = Some(text.to_string());
    }

    pub fn set_logs(&self, lines: &[&str]) {
        self.state().logs = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn fail_logs(&self, stderr: &str) {
        self.state().logs_error = Some(stderr.to_string());
    }

    /// The container exits unexpectedly
    pub fn crash(&self) {
        if let Some(container) = self.state().container.as_mut() {
            container.running = false;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().container.as_ref().is_some_and(|c| c.running)
    }

    pub fn last_spec(&self) -> Option<RunSpec> {
        self.state().last_spec.clone()
    }

    pub fn runtime_path(&self) -> Option<PathBuf> {
        self.state().runtime_path.clone()
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    fn flavor(&self) -> RuntimeFlavor {
        RuntimeFlavor::Docker
    }

    fn use_runtime(&self, runtime: &RuntimePath) {
        self.state().runtime_path = Some(runtime.path.clone());
    }

    async fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.state().images.clone())
    }

    async fn load_image(&self, _archive: &Path) -> Result<(), RuntimeError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        match state.loadable_image.clone() {
            Some(image) => {
                state.images.push(image);
                Ok(())
            }
            None => Err(failed("docker load", "invalid tar header")),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(stderr) = &state.pull_error {
            return Err(failed("docker pull", stderr));
        }
        if !state.images.iter().any(|i| i == image) {
            state.images.push(image.to_string());
        }
        state.local_revision = state.remote_revision;
        Ok(())
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>, RuntimeError> {
        let state = self.state();
        Ok(state
            .images
            .iter()
            .any(|i| i == image)
            .then(|| format!("sha256:{:064x}", state.local_revision)))
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().run_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.last_spec = Some(spec.clone());
        if let Some(stderr) = state.run_errors.pop_front() {
            return Err(failed("docker run", &stderr));
        }
        if state.container.as_ref().is_some_and(|c| c.name == spec.name) {
            return Err(failed(
                "docker run",
                &format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        state.container = Some(FakeContainer {
            name: spec.name.clone(),
            image: spec.image.clone(),
            running: true,
        });
        Ok(format!("{:064x}", self.run_calls()))
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        match self.state().container.as_mut().filter(|c| c.name == name) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(failed("docker stop", &format!("No such container: {}", name))),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.container.as_ref().is_some_and(|c| c.name == name) {
            state.container = None;
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<Option<ContainerEntry>, RuntimeError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(state.container.as_ref().filter(|c| c.name == name).map(|c| {
            let status_text = if c.running {
                state
                    .health_text
                    .clone()
                    .unwrap_or_else(|| "Up 1 minute (healthy)".to_string())
            } else {
                "Exited (137) 1 second ago".to_string()
            };
            ContainerEntry {
                name: c.name.clone(),
                running: c.running,
                status_text,
                image: Some(c.image.clone()),
                uptime: c.running.then(|| Duration::from_secs(60)),
            }
        }))
    }

    async fn stats(&self, _name: &str) -> Result<ResourceSample, RuntimeError> {
        Ok(ResourceSample {
            memory_bytes: Some(256 * MIB),
            cpu_percent: Some(1.5),
        })
    }

    async fn logs(&self, _name: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let state = self.state();
        if let Some(stderr) = &state.logs_error {
            return Err(failed("docker logs", stderr));
        }
        let skip = state.logs.len().saturating_sub(tail);
        Ok(state.logs.iter().skip(skip).cloned().collect())
    }
}

/// Readiness probe answering from a script, repeating the last answer
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<u16, String>>>,
    fallback: Result<u16, String>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = Result<u16, String>>) -> Self {
        let script: VecDeque<_> = script.into_iter().collect();
        let fallback = script.back().cloned().unwrap_or(Ok(200));
        Self {
            script: Mutex::new(script),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(code: u16) -> Self {
        Self::new([Ok(code)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self, _port: u16) -> Result<u16, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Host with fixed measurements
#[derive(Debug, Clone)]
pub struct FakeHost {
    pub family: String,
    pub version: Option<String>,
    pub arch: String,
    pub memory: u64,
    pub disk: u64,
}

impl FakeHost {
    /// macOS 14 on arm64 with plenty of memory and disk
    pub fn capable() -> Self {
        Self {
            family: "macos".to_string(),
            version: Some("14.4".to_string()),
            arch: "arm64".to_string(),
            memory: 16 * GIB,
            disk: 100 * GIB,
        }
    }
}

impl HostProbe for FakeHost {
    fn os_family(&self) -> String {
        self.family.clone()
    }

    fn os_version(&self) -> Option<String> {
        self.version.clone()
    }

    fn architecture(&self) -> String {
        self.arch.clone()
    }

    fn total_memory(&self) -> u64 {
        self.memory
    }

    fn available_disk(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.disk)
    }
}

/// Runtime provisioning step that is either already satisfied or provisions instantly
pub struct FakeRuntimeStep {
    present: bool,
    provisions: AtomicUsize,
}

impl FakeRuntimeStep {
    pub fn present() -> Self {
        Self {
            present: true,
            provisions: AtomicUsize::new(0),
        }
    }

    pub fn missing() -> Self {
        Self {
            present: false,
            provisions: AtomicUsize::new(0),
        }
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    fn path() -> RuntimePath {
        RuntimePath {
            path: PathBuf::from("/opt/runtime/docker"),
            version: "Docker version 27.0.3".to_string(),
            source: RuntimeSource::Managed,
        }
    }
}

#[async_trait]
impl ProvisionStep for FakeRuntimeStep {
    type Output = RuntimePath;

    async fn existing(&self) -> Result<Option<RuntimePath>, SetupError> {
        Ok(self.present.then(Self::path))
    }

    async fn provision(&self, progress: &ProgressFn) -> Result<RuntimePath, SetupError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        progress(0.5);
        progress(1.0);
        Ok(Self::path())
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for_state(
    shared: &SharedState,
    timeout: Duration,
    condition: impl Fn(&SharedState) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition(shared) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition(shared)
}
