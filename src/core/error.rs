//! Error types - Runtime invocation failures, the setup taxonomy and export errors

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single runtime CLI invocation
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` did not finish within {secs}s and was killed")]
    Timeout { command: String, secs: u64 },

    #[error("`{command}` exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Captured stderr (or the error text) for classification
    pub fn detail(&self) -> String {
        match self {
            Self::Failed { stderr, .. } if !stderr.trim().is_empty() => stderr.trim().to_string(),
            other => other.to_string(),
        }
    }
}

/// Setup and supervision failures surfaced to the user
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SetupError {
    #[error("unsupported system: {0}")]
    UnsupportedSystem(String),

    #[error("insufficient disk space: {required_gb:.1} GB required, {available_gb:.1} GB available")]
    InsufficientDiskSpace { required_gb: f64, available_gb: f64 },

    #[error("insufficient memory: {required_gb:.1} GB required, {available_gb:.1} GB installed")]
    InsufficientMemory { required_gb: f64, available_gb: f64 },

    #[error("bundled runtime not found at {0}")]
    BundledRuntimeMissing(PathBuf),

    #[error("image {0} is not bundled and could not be pulled")]
    BundledImageMissing(String),

    #[error("runtime extraction failed: {0}")]
    RuntimeExtractionFailed(String),

    #[error("container start failed: {0}")]
    ContainerStartFailed(String),

    #[error("port {0} is already in use")]
    PortUnavailable(u16),

    #[error("container not ready after {attempts} attempts")]
    ContainerNotReady { attempts: u32 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SetupError {
    /// Stable name of the variant, used in reports and history
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedSystem(_) => "UnsupportedSystem",
            Self::InsufficientDiskSpace { .. } => "InsufficientDiskSpace",
            Self::InsufficientMemory { .. } => "InsufficientMemory",
            Self::BundledRuntimeMissing(_) => "BundledRuntimeMissing",
            Self::BundledImageMissing(_) => "BundledImageMissing",
            Self::RuntimeExtractionFailed(_) => "RuntimeExtractionFailed",
            Self::ContainerStartFailed(_) => "ContainerStartFailed",
            Self::PortUnavailable(_) => "PortUnavailable",
            Self::ContainerNotReady { .. } => "ContainerNotReady",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::NetworkError(_) => "NetworkError",
            Self::Cancelled => "Cancelled",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Actionable sentence shown in the `Error` state
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedSystem(detail) => format!(
                "This computer is not supported: {}. Check the system requirements for this release.",
                detail
            ),
            Self::InsufficientDiskSpace {
                required_gb,
                available_gb,
            } => format!(
                "Not enough free disk space: {:.1} GB is required but only {:.1} GB is available. Free up some space and try again.",
                required_gb, available_gb
            ),
            Self::InsufficientMemory {
                required_gb,
                available_gb,
            } => format!(
                "Not enough memory: {:.1} GB is required but this computer has {:.1} GB.",
                required_gb, available_gb
            ),
            Self::BundledRuntimeMissing(_) => {
                "The bundled container runtime is missing. Reinstall the application and try again."
                    .to_string()
            }
            Self::BundledImageMissing(image) => format!(
                "The application image ({}) is not available offline and could not be downloaded. Reinstall the application or check your internet connection.",
                image
            ),
            Self::RuntimeExtractionFailed(detail) => format!(
                "The container runtime could not be prepared ({}). Reinstall the application and try again.",
                detail
            ),
            Self::ContainerStartFailed(detail) => format!(
                "The service container failed to start ({}). Restart to try again, or export diagnostics if the problem persists.",
                detail
            ),
            Self::PortUnavailable(port) => format!(
                "Port {} is already in use; close other applications using this port or change it in settings.",
                port
            ),
            Self::ContainerNotReady { attempts } => format!(
                "The service did not respond after {} checks. Restart to try again, or export diagnostics if the problem persists.",
                attempts
            ),
            Self::PermissionDenied(detail) => format!(
                "Permission denied ({}). Make sure the application can access its data folder and the container runtime.",
                detail
            ),
            Self::NetworkError(detail) => format!(
                "A network error occurred ({}). Check your internet connection and try again.",
                detail
            ),
            Self::Cancelled => "Setup was cancelled.".to_string(),
            Self::Unknown(detail) => format!(
                "An unexpected error occurred ({}). Restart to try again.",
                detail
            ),
        }
    }

    /// Classify a failed `run` invocation
    pub fn from_start_failure(err: &RuntimeError, port: u16) -> Self {
        let detail = err.detail();
        let lower = detail.to_lowercase();
        // Privileged ports fail with "bind: permission denied"
        if lower.contains("permission denied") {
            Self::PermissionDenied(detail)
        } else if lower.contains("address already in use")
            || lower.contains("port is already allocated")
            || lower.contains("bind: ")
        {
            Self::PortUnavailable(port)
        } else {
            Self::ContainerStartFailed(detail)
        }
    }

    /// Classify a failed `pull` invocation
    pub fn from_pull_failure(err: &RuntimeError, image: &str) -> Self {
        let detail = err.detail();
        if looks_like_network_failure(&detail) || matches!(err, RuntimeError::Timeout { .. }) {
            Self::NetworkError(detail)
        } else if detail.to_lowercase().contains("permission denied") {
            Self::PermissionDenied(detail)
        } else {
            Self::BundledImageMissing(image.to_string())
        }
    }
}

/// Failure to render or write a diagnostic report
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn looks_like_network_failure(detail: &str) -> bool {
    const MARKERS: &[&str] = &[
        "dial tcp",
        "no such host",
        "network is unreachable",
        "connection refused",
        "connection reset",
        "tls handshake",
        "i/o timeout",
        "temporary failure in name resolution",
        "timeout",
    ];
    let lower = detail.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}
