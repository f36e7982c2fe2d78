//! Diagnostics - Point-in-time reports for troubleshooting, available in any state
//!
//! Collection never fails: anything that cannot be gathered is recorded as a
//! note in the report. Only exporting can fail, and that error goes back to
//! the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::container::ContainerController;
use super::error::DiagnosticsError;
use super::logbuffer::LogBuffer;
use super::requirements::HostProbe;
use super::resource::format_bytes;
use super::settings::AppConfiguration;
use super::shared::SharedState;
use super::status::ContainerStatus;
use crate::persistence::HistoryEntry;

/// Lifecycle transitions included in a report
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub os_version: String,
    pub architecture: String,
    pub total_memory: u64,
    pub available_disk_space: Option<u64>,
    pub app_version: String,
}

/// Immutable snapshot of the engine and its host
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub report_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub lifecycle_state: String,
    pub system_info: SystemInfo,
    pub container_status: ContainerStatus,
    pub configuration: AppConfiguration,
    pub app_logs: Vec<String>,
    pub container_logs: Vec<String>,
    pub lifecycle_history: Vec<HistoryEntry>,
    /// Problems met while collecting
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Text,
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }

    pub fn all() -> &'static [ExportFormat] {
        &[ExportFormat::Text, ExportFormat::Json, ExportFormat::Markdown]
    }
}

pub struct DiagnosticsCollector {
    config: Arc<AppConfiguration>,
    controller: Arc<ContainerController>,
    shared: SharedState,
    host: Arc<dyn HostProbe>,
    app_logs: Option<LogBuffer>,
}

impl DiagnosticsCollector {
    pub fn new(
        config: Arc<AppConfiguration>,
        controller: Arc<ContainerController>,
        shared: SharedState,
        host: Arc<dyn HostProbe>,
    ) -> Self {
        Self {
            config,
            controller,
            shared,
            host,
            app_logs: None,
        }
    }

    /// Include the in-memory application log ring in reports
    pub fn with_app_logs(mut self, buffer: LogBuffer) -> Self {
        self.app_logs = Some(buffer);
        self
    }

    /// Gather a report; read-only and callable from any lifecycle state
    pub async fn collect(&self) -> DiagnosticReport {
        let snapshot = self.shared.snapshot();
        let mut notes = Vec::new();

        let host = self.host.clone();
        let data_directory = self.config.get_data_directory();
        let system_info = match tokio::task::spawn_blocking(move || system_info(host.as_ref(), &data_directory)).await {
            Ok((info, note)) => {
                notes.extend(note);
                info
            }
            Err(e) => {
                notes.push(format!("System information unavailable: {}", e));
                SystemInfo {
                    os_version: "unknown".to_string(),
                    architecture: "unknown".to_string(),
                    total_memory: 0,
                    available_disk_space: None,
                    app_version: env!("CARGO_PKG_VERSION").to_string(),
                }
            }
        };

        let app_logs = match &self.app_logs {
            Some(buffer) => buffer.snapshot(),
            None => {
                notes.push("Application log capture is disabled".to_string());
                Vec::new()
            }
        };

        let container_logs = match self
            .controller
            .logs(&self.config.container_name, self.config.log_tail_lines)
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Container logs unavailable for diagnostics: {}", e);
                notes.push(format!("Container logs unavailable: {}", e.detail()));
                Vec::new()
            }
        };

        let lifecycle_history = match self.shared.journal() {
            Some(db) => db.recent_history(HISTORY_LIMIT).unwrap_or_else(|e| {
                notes.push(format!("Lifecycle history unavailable: {}", e));
                Vec::new()
            }),
            None => Vec::new(),
        };

        DiagnosticReport {
            report_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: self.shared.session_id().to_string(),
            lifecycle_state: snapshot.state.describe(),
            system_info,
            container_status: snapshot.container_status,
            configuration: self.config.as_ref().clone(),
            app_logs,
            container_logs,
            lifecycle_history,
            notes,
        }
    }

    /// Write the report to `directory` as `diagnostics-<timestamp>.<ext>`
    pub async fn export_to(
        &self,
        report: &DiagnosticReport,
        format: ExportFormat,
        directory: &Path,
    ) -> Result<PathBuf, DiagnosticsError> {
        let rendered = report.render(format)?;
        let path = directory.join(format!(
            "diagnostics-{}.{}",
            report.timestamp.format("%Y%m%d-%H%M%S"),
            format.extension()
        ));

        let write = async {
            tokio::fs::create_dir_all(directory).await?;
            tokio::fs::write(&path, rendered).await
        };
        write.await.map_err(|source| DiagnosticsError::Write {
            path: path.clone(),
            source,
        })?;

        info!("Diagnostic report written to {:?}", path);
        Ok(path)
    }
}

fn system_info(host: &dyn HostProbe, data_directory: &Path) -> (SystemInfo, Option<String>) {
    let os_version = match host.os_version() {
        Some(version) => format!("{} {}", host.os_family(), version),
        None => host.os_family(),
    };
    let (available_disk_space, note) = match host.available_disk(data_directory) {
        Ok(bytes) => (Some(bytes), None),
        Err(e) => (None, Some(format!("Free disk space unavailable: {}", e))),
    };
    (
        SystemInfo {
            os_version,
            architecture: host.architecture(),
            total_memory: host.total_memory(),
            available_disk_space,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        note,
    )
}

impl DiagnosticReport {
    pub fn render(&self, format: ExportFormat) -> Result<String, DiagnosticsError> {
        Ok(match format {
            ExportFormat::Text => self.to_string(),
            ExportFormat::Json => serde_json::to_string_pretty(self)?,
            ExportFormat::Markdown => self.to_markdown()?,
        })
    }

    /// Configuration as sorted `(field, value)` pairs
    fn configuration_fields(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        let value = serde_json::to_value(&self.configuration)?;
        let mut fields: Vec<(String, String)> = value
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let shown = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), shown)
                    })
                    .collect()
            })
            .unwrap_or_default();
        fields.sort();
        Ok(fields)
    }

    fn disk_string(&self) -> String {
        self.system_info
            .available_disk_space
            .map(format_bytes)
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn to_markdown(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        let status = &self.container_status;

        out.push_str("# Diagnostic Report\n\n");
        out.push_str(&format!("- **Report ID**: {}\n", self.report_id));
        out.push_str(&format!("- **Timestamp**: {}\n", self.timestamp.to_rfc3339()));
        out.push_str(&format!("- **Session**: {}\n", self.session_id));
        out.push_str(&format!("- **State**: {}\n\n", self.lifecycle_state));

        out.push_str("## System Information\n\n");
        out.push_str(&format!("- **OS Version**: {}\n", self.system_info.os_version));
        out.push_str(&format!("- **Architecture**: {}\n", self.system_info.architecture));
        out.push_str(&format!(
            "- **Total Memory**: {}\n",
            format_bytes(self.system_info.total_memory)
        ));
        out.push_str(&format!("- **Available Disk Space**: {}\n", self.disk_string()));
        out.push_str(&format!("- **App Version**: {}\n\n", self.system_info.app_version));

        out.push_str("## Container Status\n\n");
        out.push_str(&format!("- **Running**: {}\n", status.is_running));
        out.push_str(&format!("- **Health**: {}\n", status.health.label()));
        out.push_str(&format!("- **Port**: {}\n", status.port));
        out.push_str(&format!("- **Uptime**: {}\n", status.uptime_string()));
        out.push_str(&format!("- **Memory Usage**: {}\n", status.memory_string()));
        out.push_str(&format!("- **CPU Usage**: {}\n\n", status.cpu_string()));

        out.push_str("## Configuration\n\n");
        for (key, value) in self.configuration_fields()? {
            out.push_str(&format!("- **{}**: {}\n", key, value));
        }
        out.push('\n');

        push_code_block(&mut out, "## Application Logs", &self.app_logs);
        push_code_block(&mut out, "## Container Logs", &self.container_logs);

        out.push_str("## Lifecycle History\n\n");
        if self.lifecycle_history.is_empty() {
            out.push_str("_No recorded transitions._\n");
        }
        for entry in &self.lifecycle_history {
            out.push_str(&format!(
                "- {} {} -> {}{}\n",
                entry.recorded_at.to_rfc3339(),
                entry.from_state,
                entry.to_state,
                entry.detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default()
            ));
        }

        if !self.notes.is_empty() {
            out.push_str("\n## Notes\n\n");
            for note in &self.notes {
                out.push_str(&format!("- {}\n", note));
            }
        }
        Ok(out)
    }
}

fn push_code_block(out: &mut String, header: &str, lines: &[String]) {
    out.push_str(header);
    out.push_str("\n\n```\n");
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("```\n\n");
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = &self.container_status;

        writeln!(f, "Diagnostic Report")?;
        writeln!(f, "=================")?;
        writeln!(f, "Report ID: {}", self.report_id)?;
        writeln!(f, "Timestamp: {}", self.timestamp.to_rfc3339())?;
        writeln!(f, "Session:   {}", self.session_id)?;
        writeln!(f, "State:     {}", self.lifecycle_state)?;
        writeln!(f)?;

        writeln!(f, "System Information")?;
        writeln!(f, "------------------")?;
        writeln!(f, "  OS Version:     {}", self.system_info.os_version)?;
        writeln!(f, "  Architecture:   {}", self.system_info.architecture)?;
        writeln!(f, "  Total Memory:   {}", format_bytes(self.system_info.total_memory))?;
        writeln!(f, "  Free Disk:      {}", self.disk_string())?;
        writeln!(f, "  App Version:    {}", self.system_info.app_version)?;
        writeln!(f)?;

        writeln!(f, "Container Status")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  Running:        {}", status.is_running)?;
        writeln!(f, "  Health:         {}", status.health.label())?;
        writeln!(f, "  Port:           {}", status.port)?;
        writeln!(f, "  Uptime:         {}", status.uptime_string())?;
        writeln!(f, "  Memory Usage:   {}", status.memory_string())?;
        writeln!(f, "  CPU Usage:      {}", status.cpu_string())?;
        writeln!(f)?;

        writeln!(f, "Configuration")?;
        writeln!(f, "-------------")?;
        let fields = self.configuration_fields().map_err(|_| fmt::Error)?;
        for (key, value) in fields {
            writeln!(f, "  {}: {}", key, value)?;
        }
        writeln!(f)?;

        writeln!(f, "Application Logs")?;
        writeln!(f, "----------------")?;
        for line in &self.app_logs {
            writeln!(f, "  {}", line)?;
        }
        writeln!(f)?;

        writeln!(f, "Container Logs")?;
        writeln!(f, "--------------")?;
        for line in &self.container_logs {
            writeln!(f, "  {}", line)?;
        }
        writeln!(f)?;

        writeln!(f, "Lifecycle History")?;
        writeln!(f, "-----------------")?;
        for entry in &self.lifecycle_history {
            writeln!(
                f,
                "  {} {} -> {}",
                entry.recorded_at.to_rfc3339(),
                entry.from_state,
                entry.to_state
            )?;
        }

        if !self.notes.is_empty() {
            writeln!(f)?;
            writeln!(f, "Notes")?;
            writeln!(f, "-----")?;
            for note in &self.notes {
                writeln!(f, "  {}", note)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SetupError;
    use crate::core::lifecycle::LifecycleState;
    use crate::core::testing::{FakeHost, FakeRuntime};
    use crate::persistence::Database;

    const MARKDOWN_HEADERS: &[&str] = &[
        "# Diagnostic Report",
        "## System Information",
        "## Container Status",
        "## Configuration",
        "## Application Logs",
        "## Container Logs",
        "## Lifecycle History",
    ];

    fn collector(runtime: Arc<FakeRuntime>, shared: SharedState) -> DiagnosticsCollector {
        let buffer = LogBuffer::new(10);
        buffer.push("INFO launcher started");
        DiagnosticsCollector::new(
            Arc::new(AppConfiguration::default()),
            Arc::new(ContainerController::new(runtime)),
            shared,
            Arc::new(FakeHost::capable()),
        )
        .with_app_logs(buffer)
    }

    #[tokio::test]
    async fn collects_in_error_state_with_log_failure_noted() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let shared = SharedState::new(3000).with_journal(db);
        shared.transition(LifecycleState::CheckingRequirements);
        shared.fail(SetupError::InsufficientMemory {
            required_gb: 4.0,
            available_gb: 2.0,
        });

        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_logs("Error: No such container: open-webui");
        let report = collector(runtime, shared).collect().await;

        assert!(report.lifecycle_state.starts_with("Error"));
        assert_eq!(report.app_logs, vec!["INFO launcher started"]);
        assert!(report.container_logs.is_empty());
        assert!(report.notes.iter().any(|n| n.contains("No such container")));
        assert_eq!(report.lifecycle_history.len(), 2);
        assert_eq!(report.system_info.os_version, "macos 14.4");
    }

    #[tokio::test]
    async fn every_format_renders_parseable_output() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_logs(&["Uvicorn running on http://0.0.0.0:8080"]);
        let report = collector(runtime, SharedState::new(3000)).collect().await;

        let json: serde_json::Value =
            serde_json::from_str(&report.render(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["systemInfo"]["architecture"], "arm64");
        assert_eq!(json["containerStatus"]["port"], 3000);
        assert_eq!(json["configuration"]["containerPort"], 3000);
        assert_eq!(json["containerLogs"][0], "Uvicorn running on http://0.0.0.0:8080");
        assert!(json.get("appLogs").is_some());

        let markdown = report.render(ExportFormat::Markdown).unwrap();
        for header in MARKDOWN_HEADERS {
            assert!(markdown.contains(header), "missing {header}");
        }
        assert!(markdown.contains("**image**: ghcr.io/open-webui/open-webui:main"));

        let text = report.render(ExportFormat::Text).unwrap();
        assert!(text.starts_with("Diagnostic Report"));
        assert!(text.contains("containerName: open-webui"));
    }

    #[tokio::test]
    async fn export_writes_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(Arc::new(FakeRuntime::new()), SharedState::new(3000));
        let report = collector.collect().await;

        for format in ExportFormat::all() {
            let path = collector.export_to(&report, *format, dir.path()).await.unwrap();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("diagnostics-"));
            assert!(name.ends_with(format.extension()));
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn export_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let collector = collector(Arc::new(FakeRuntime::new()), SharedState::new(3000));
        let report = collector.collect().await;

        let err = collector
            .export_to(&report, ExportFormat::Json, &blocker.join("nested"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosticsError::Write { .. }));
    }
}
