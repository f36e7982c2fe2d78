//! Application configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::resource::ResourceLimits;

/// Container runtime family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RuntimeFlavor {
    #[default]
    Docker,
    Podman,
}

impl RuntimeFlavor {
    /// Executable name of the runtime CLI
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// Whether `run` accepts `--replace`
    pub fn supports_replace(&self) -> bool {
        matches!(self, Self::Podman)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "podman" => Some(Self::Podman),
            _ => None,
        }
    }
}

/// Session configuration for the launcher.
///
/// Created once at startup from stored values and environment overrides; the
/// engine only ever reads it.
///
/// Stored as camelCase JSON; snake_case keys from older stores still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfiguration {
    // General
    /// Host port the service is published on
    #[serde(alias = "container_port")]
    pub container_port: u16,
    /// Start the container when the launcher starts
    #[serde(alias = "auto_start_container")]
    pub auto_start_container: bool,
    /// Show desktop notifications for lifecycle events
    #[serde(alias = "enable_notifications")]
    pub enable_notifications: bool,
    /// Capture application logs for diagnostic reports
    #[serde(alias = "enable_diagnostics")]
    pub enable_diagnostics: bool,
    /// Pull a newer image once the service is first ready
    #[serde(alias = "check_for_updates")]
    pub check_for_updates: bool,
    /// Open the service in the browser once it is ready
    #[serde(alias = "open_browser_when_ready")]
    pub open_browser_when_ready: bool,

    // Container
    /// Fixed name of the managed container
    #[serde(alias = "container_name")]
    pub container_name: String,
    /// Image reference (name:tag)
    pub image: String,
    /// Port the service listens on inside the container
    #[serde(alias = "internal_port")]
    pub internal_port: u16,
    /// Mount point of the data volume inside the container
    #[serde(alias = "container_data_path")]
    pub container_data_path: String,
    /// Environment variables passed to the container
    pub environment: Vec<(String, String)>,
    /// Secret names resolved from the environment or /run/secrets
    #[serde(alias = "secret_names")]
    pub secret_names: Vec<String>,
    /// CPU and memory limits
    #[serde(alias = "resource_limits")]
    pub resource_limits: ResourceLimits,

    // Runtime
    /// Which runtime CLI to drive
    #[serde(alias = "runtime_flavor")]
    pub runtime_flavor: RuntimeFlavor,
    /// Accept a runtime already installed on PATH
    #[serde(alias = "allow_system_runtime")]
    pub allow_system_runtime: bool,
    /// Fall back to a registry pull when no bundled image exists
    #[serde(alias = "allow_registry_pull")]
    pub allow_registry_pull: bool,
    /// Timeout for ordinary runtime invocations in seconds
    #[serde(alias = "command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Timeout for image load/pull invocations in seconds
    #[serde(alias = "image_timeout_secs")]
    pub image_timeout_secs: u64,

    // Supervision
    /// Health check interval in seconds
    #[serde(alias = "health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Readiness polls during initial startup
    #[serde(alias = "readiness_max_attempts")]
    pub readiness_max_attempts: u32,
    /// Delay between readiness polls in milliseconds
    #[serde(alias = "readiness_interval_ms")]
    pub readiness_interval_ms: u64,
    /// Per-request timeout for a readiness poll in milliseconds
    #[serde(alias = "readiness_request_timeout_ms")]
    pub readiness_request_timeout_ms: u64,
    /// Readiness polls during automatic recovery
    #[serde(alias = "recovery_max_attempts")]
    pub recovery_max_attempts: u32,

    // Diagnostics
    /// Container log lines included in reports
    #[serde(alias = "log_tail_lines")]
    pub log_tail_lines: usize,
    /// Application log lines kept in memory
    #[serde(alias = "app_log_capacity")]
    pub app_log_capacity: usize,

    // Advanced
    /// Custom data directory
    #[serde(alias = "data_directory")]
    pub data_directory: Option<PathBuf>,
    /// Directory holding bundled resources (runtime payload, image archive)
    #[serde(alias = "bundle_directory")]
    pub bundle_directory: Option<PathBuf>,
}

impl Default for AppConfiguration {
    fn default() -> Self {
        Self {
            // General
            container_port: 3000,
            auto_start_container: true,
            enable_notifications: true,
            enable_diagnostics: true,
            check_for_updates: true,
            open_browser_when_ready: false,

            // Container
            container_name: "open-webui".to_string(),
            image: "ghcr.io/open-webui/open-webui:main".to_string(),
            internal_port: 8080,
            container_data_path: "/app/backend/data".to_string(),
            environment: vec![(
                "OLLAMA_API_BASE_URL".to_string(),
                "http://host.docker.internal:11434/api".to_string(),
            )],
            secret_names: vec![
                "OPENAI_API_KEY".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "HUGGINGFACE_TOKEN".to_string(),
                "WEBUI_SECRET_KEY".to_string(),
            ],
            resource_limits: ResourceLimits::default(),

            // Runtime
            runtime_flavor: RuntimeFlavor::Docker,
            allow_system_runtime: true,
            allow_registry_pull: true,
            command_timeout_secs: 30,
            image_timeout_secs: 900,

            // Supervision
            health_check_interval_secs: 30,
            readiness_max_attempts: 60,
            readiness_interval_ms: 2000,
            readiness_request_timeout_ms: 2000,
            recovery_max_attempts: 15,

            // Diagnostics
            log_tail_lines: 200,
            app_log_capacity: 500,

            // Advanced
            data_directory: None,
            bundle_directory: None,
        }
    }
}

impl AppConfiguration {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("WebUILauncher")
        })
    }

    /// Host directory mounted into the container
    pub fn get_volume_directory(&self) -> PathBuf {
        self.get_data_directory().join("data")
    }

    /// Managed location of the extracted runtime binary
    pub fn get_runtime_directory(&self) -> PathBuf {
        self.get_data_directory().join("runtime")
    }

    /// Get the logs directory
    pub fn get_logs_directory(&self) -> PathBuf {
        self.get_data_directory().join("logs")
    }

    /// Bundled resources, next to the executable unless configured
    pub fn get_bundle_directory(&self) -> PathBuf {
        self.bundle_directory.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.join("resources")))
                .unwrap_or_else(|| PathBuf::from("resources"))
        })
    }

    /// URL of the service on the host
    pub fn service_url(&self) -> String {
        format!("http://localhost:{}", self.container_port)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn readiness_request_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_request_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    /// Apply per-session overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("WEBUI_LAUNCHER_PORT").and_then(|p| p.parse().ok()) {
            self.container_port = port;
        }
        if let Some(image) = lookup("WEBUI_LAUNCHER_IMAGE").filter(|i| !i.trim().is_empty()) {
            self.image = image;
        }
        if let Some(flavor) = lookup("WEBUI_LAUNCHER_RUNTIME").and_then(|r| RuntimeFlavor::parse(&r))
        {
            self.runtime_flavor = flavor;
        }
    }

    /// Validate configuration and fix any invalid values
    pub fn validate(&mut self) {
        if self.container_port == 0 {
            self.container_port = 3000;
        }
        if self.internal_port == 0 {
            self.internal_port = 8080;
        }
        if self.container_name.trim().is_empty() {
            self.container_name = "open-webui".to_string();
        }
        if !self.resource_limits.is_valid() {
            self.resource_limits = ResourceLimits::default();
        }
        self.command_timeout_secs = self.command_timeout_secs.max(1);
        self.image_timeout_secs = self.image_timeout_secs.max(self.command_timeout_secs);
        self.health_check_interval_secs = self.health_check_interval_secs.max(1);
        self.readiness_max_attempts = self.readiness_max_attempts.max(1);
        self.recovery_max_attempts = self.recovery_max_attempts.clamp(1, self.readiness_max_attempts);
        self.readiness_interval_ms = self.readiness_interval_ms.max(10);
        self.readiness_request_timeout_ms = self.readiness_request_timeout_ms.max(10);
        self.log_tail_lines = self.log_tail_lines.clamp(1, 10_000);
        self.app_log_capacity = self.app_log_capacity.clamp(10, 100_000);
    }
}
