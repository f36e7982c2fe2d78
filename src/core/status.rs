//! Container status - Last observed state of the managed container

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::resource::format_bytes;

/// Health reported by the runtime for the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopped,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Derive health from a `ps` status column such as "Up 5 minutes (healthy)"
    pub fn from_status_text(running: bool, text: &str) -> Self {
        if !running {
            return Self::Stopped;
        }
        let lower = text.to_lowercase();
        if lower.contains("(unhealthy)") {
            Self::Unhealthy
        } else if lower.contains("(healthy)") {
            Self::Healthy
        } else if lower.contains("health: starting") || lower.contains("(starting)") {
            Self::Starting
        } else {
            // No healthcheck defined; running is the best signal available
            Self::Healthy
        }
    }
}

/// Snapshot of the managed container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub is_running: bool,
    pub health: HealthStatus,
    #[serde(with = "duration_secs")]
    pub uptime: Option<Duration>,
    #[serde(rename = "memoryUsage")]
    pub memory_usage_bytes: Option<u64>,
    #[serde(rename = "cpuUsage")]
    pub cpu_usage_percent: Option<f64>,
    pub port: u16,
    pub image_version: Option<String>,
}

impl ContainerStatus {
    /// Status before anything has been observed
    pub fn unknown(port: u16) -> Self {
        Self {
            is_running: false,
            health: HealthStatus::Unknown,
            uptime: None,
            memory_usage_bytes: None,
            cpu_usage_percent: None,
            port,
            image_version: None,
        }
    }

    /// Status of a container that does not exist or has exited
    pub fn stopped(port: u16) -> Self {
        Self {
            health: HealthStatus::Stopped,
            ..Self::unknown(port)
        }
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        match self.uptime {
            Some(duration) => {
                let secs = duration.as_secs();
                if secs < 60 {
                    format!("{}s", secs)
                } else if secs < 3600 {
                    format!("{}m {}s", secs / 60, secs % 60)
                } else if secs < 86400 {
                    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
                } else {
                    format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
                }
            }
            None => "-".to_string(),
        }
    }

    pub fn memory_string(&self) -> String {
        self.memory_usage_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn cpu_string(&self) -> String {
        self.cpu_usage_percent
            .map(|c| format!("{:.1}%", c))
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Serialize an optional duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
