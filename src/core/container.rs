//! Container controller - Idempotent start/stop of the single managed container

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::error::{RuntimeError, SetupError};
use super::runtime::{RunSpec, RuntimeAdapter};
use super::settings::AppConfiguration;
use super::status::{ContainerStatus, HealthStatus};

/// Directory the container runtime mounts secrets into
pub const DEFAULT_SECRETS_DIR: &str = "/run/secrets";

/// A started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub port: u16,
}

pub struct ContainerController {
    runtime: Arc<dyn RuntimeAdapter>,
    secrets_dir: PathBuf,
}

impl ContainerController {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            runtime,
            secrets_dir: PathBuf::from(DEFAULT_SECRETS_DIR),
        }
    }

    pub fn with_secrets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secrets_dir = dir.into();
        self
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeAdapter> {
        &self.runtime
    }

    /// Replace any container with the configured name by a fresh one
    pub async fn start(&self, config: &AppConfiguration) -> Result<ContainerHandle, SetupError> {
        let name = &config.container_name;

        // Clear stale containers so the name and port are free
        self.stop(name).await;

        let volume = config.get_volume_directory();
        tokio::fs::create_dir_all(&volume).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                SetupError::PermissionDenied(format!("{}: {}", volume.display(), e))
            }
            _ => SetupError::ContainerStartFailed(format!(
                "could not create data directory {}: {}",
                volume.display(),
                e
            )),
        })?;

        let secrets = resolve_secrets(&config.secret_names, |k| std::env::var(k).ok(), &self.secrets_dir);
        let spec = build_run_spec(config, volume, secrets);

        info!(
            "Starting container {} from {} on port {}",
            name, config.image, config.container_port
        );
        let id = self
            .runtime
            .run(&spec)
            .await
            .map_err(|e| SetupError::from_start_failure(&e, config.container_port))?;
        debug!("Container {} started with id {}", name, id);

        Ok(ContainerHandle {
            id,
            name: name.clone(),
            port: config.container_port,
        })
    }

    /// Best-effort stop and remove; an absent container is not an error
    pub async fn stop(&self, name: &str) {
        if let Err(e) = self.runtime.stop(name).await {
            debug!("Stop of {} skipped: {}", name, e.detail());
        }
        if let Err(e) = self.runtime.remove(name).await {
            debug!("Remove of {} skipped: {}", name, e.detail());
        }
    }

    /// Current status with best-effort resource usage
    pub async fn status(&self, config: &AppConfiguration) -> Result<ContainerStatus, RuntimeError> {
        let name = &config.container_name;
        let port = config.container_port;

        let Some(entry) = self.runtime.status(name).await? else {
            return Ok(ContainerStatus::stopped(port));
        };

        let mut status = ContainerStatus {
            is_running: entry.running,
            health: HealthStatus::from_status_text(entry.running, &entry.status_text),
            uptime: entry.uptime,
            image_version: entry.image.as_deref().map(image_tag),
            ..ContainerStatus::unknown(port)
        };

        if entry.running {
            match self.runtime.stats(name).await {
                Ok(sample) => {
                    status.memory_usage_bytes = sample.memory_bytes;
                    status.cpu_usage_percent = sample.cpu_percent;
                }
                Err(e) => debug!("Stats for {} unavailable: {}", name, e),
            }
        }
        Ok(status)
    }

    pub async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        self.runtime.logs(name, tail).await
    }
}

/// Translate the session configuration into runtime arguments
pub fn build_run_spec(
    config: &AppConfiguration,
    volume_host: PathBuf,
    secrets: Vec<(String, String)>,
) -> RunSpec {
    let mut environment = config.environment.clone();
    for (key, value) in secrets {
        environment.retain(|(k, _)| k != &key);
        environment.push((key, value));
    }

    RunSpec {
        name: config.container_name.clone(),
        image: config.image.clone(),
        host_port: config.container_port,
        internal_port: config.internal_port,
        volume_host,
        volume_container: config.container_data_path.clone(),
        environment,
        extra_hosts: vec![(
            "host.docker.internal".to_string(),
            "host-gateway".to_string(),
        )],
        memory: config.resource_limits.memory.clone(),
        cpus: config.resource_limits.cpus.clone(),
    }
}

/// Resolve secret values from the environment first, then the secrets directory
pub fn resolve_secrets(
    names: &[String],
    env: impl Fn(&str) -> Option<String>,
    secrets_dir: &Path,
) -> Vec<(String, String)> {
    names
        .iter()
        .filter_map(|name| {
            let value = env(name)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| {
                    std::fs::read_to_string(secrets_dir.join(name))
                        .ok()
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                });
            if value.is_none() {
                debug!("Secret {} not provided", name);
            }
            value.map(|v| (name.clone(), v))
        })
        .collect()
}

/// Tag portion of an image reference ("main" for "repo/name:main")
fn image_tag(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        Some((_, tag)) => tag.to_string(),
        None => "latest".to_string(),
    }
}
