//! Runtime adapter - Narrow interface over Docker/Podman-style CLIs
//!
//! The engine never scrapes runtime output itself; everything goes through
//! [`RuntimeAdapter`], so the pipeline can run against a fake in tests and the
//! concrete runtime stays swappable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::error::RuntimeError;
use super::process::{args, CommandRunner};
use super::resource::{parse_percent, parse_size};
use super::settings::RuntimeFlavor;

/// Where the runtime executable came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSource {
    /// Extracted into the managed directory by the launcher
    Managed,
    /// Installed on the system PATH
    System,
}

/// Resolved, verified runtime executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePath {
    pub path: PathBuf,
    pub version: String,
    pub source: RuntimeSource,
}

/// Everything needed to create the managed container
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub volume_host: PathBuf,
    pub volume_container: String,
    pub environment: Vec<(String, String)>,
    pub extra_hosts: Vec<(String, String)>,
    pub memory: String,
    pub cpus: String,
}

/// One row of `ps` output for the managed container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerEntry {
    pub name: String,
    pub running: bool,
    pub status_text: String,
    pub image: Option<String>,
    pub uptime: Option<Duration>,
}

/// Best-effort resource sample from `stats`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

/// Operations the engine needs from a container runtime
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Runtime family driven by this adapter
    fn flavor(&self) -> RuntimeFlavor;

    /// Point the adapter at a resolved runtime executable
    fn use_runtime(&self, runtime: &RuntimePath);

    /// Local images as `name:tag`
    async fn list_images(&self) -> Result<Vec<String>, RuntimeError>;

    /// Load an image archive
    async fn load_image(&self, archive: &Path) -> Result<(), RuntimeError>;

    /// Pull an image from its registry
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Content id of a local image, `None` if it is not present
    async fn image_id(&self, image: &str) -> Result<Option<String>, RuntimeError>;

    /// Create and start a detached container, returning its id
    async fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError>;

    /// Stop a container by name
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container by name
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Status of the named container, `None` if it does not exist
    async fn status(&self, name: &str) -> Result<Option<ContainerEntry>, RuntimeError>;

    /// Resource usage of the named container
    async fn stats(&self, name: &str) -> Result<ResourceSample, RuntimeError>;

    /// Last `tail` log lines of the named container
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, RuntimeError>;
}

/// [`RuntimeAdapter`] backed by the docker or podman command line
pub struct CliRuntime {
    runner: CommandRunner,
    flavor: RuntimeFlavor,
    program: RwLock<PathBuf>,
    image_timeout: Duration,
}

impl CliRuntime {
    pub fn new(flavor: RuntimeFlavor, command_timeout: Duration, image_timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(command_timeout),
            flavor,
            program: RwLock::new(PathBuf::from(flavor.binary_name())),
            image_timeout,
        }
    }

    pub fn program(&self) -> PathBuf {
        self.program
            .read()
            .map(|p| p.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    async fn invoke(&self, arguments: Vec<OsString>) -> Result<String, RuntimeError> {
        let output = self.runner.run(&self.program(), &arguments).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl RuntimeAdapter for CliRuntime {
    fn flavor(&self) -> RuntimeFlavor {
        self.flavor
    }

    fn use_runtime(&self, runtime: &RuntimePath) {
        let mut program = self.program.write().unwrap_or_else(|e| e.into_inner());
        *program = runtime.path.clone();
        debug!("Runtime adapter now using {:?}", runtime.path);
    }

    async fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        let stdout = self.invoke(args(["images", "--format", "json"])).await?;
        parse_image_list(&stdout)
    }

    async fn load_image(&self, archive: &Path) -> Result<(), RuntimeError> {
        info!("Loading image archive {:?}", archive);
        let arguments = vec![
            OsString::from("load"),
            OsString::from("-i"),
            archive.as_os_str().to_os_string(),
        ];
        self.runner
            .run_with_timeout(&self.program(), &arguments, self.image_timeout)
            .await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!("Pulling image {}", image);
        self.runner
            .run_with_timeout(&self.program(), &args(["pull", image]), self.image_timeout)
            .await?;
        Ok(())
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>, RuntimeError> {
        match self
            .invoke(args(["image", "inspect", "--format", "{{.Id}}", image]))
            .await
        {
            Ok(stdout) => Ok(Some(stdout.trim().to_string()).filter(|id| !id.is_empty())),
            Err(e) if is_missing_image(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError> {
        let stdout = self.invoke(build_run_args(spec, self.flavor)).await?;
        Ok(stdout.trim().to_string())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.invoke(args(["stop", name])).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.invoke(args(["rm", "-f", name])).await.map(|_| ())
    }

    async fn status(&self, name: &str) -> Result<Option<ContainerEntry>, RuntimeError> {
        let filter = format!("name={}", name);
        let stdout = self
            .invoke(args(["ps", "--filter", filter.as_str(), "--format", "json"]))
            .await?;
        let now = chrono::Utc::now().timestamp();
        Ok(parse_ps(&stdout, now)?.into_iter().find(|e| e.name == name))
    }

    async fn stats(&self, name: &str) -> Result<ResourceSample, RuntimeError> {
        let stdout = self
            .invoke(args(["stats", "--no-stream", "--format", "json", name]))
            .await?;
        parse_stats(&stdout)
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let tail_arg = tail.to_string();
        let output = self
            .runner
            .run(&self.program(), &args(["logs", "--tail", tail_arg.as_str(), name]))
            .await?;
        // Containers write to both streams; the runtime relays them separately
        let lines: Vec<String> = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

/// Arguments for `run`, following the fixed port/volume/env/limit contract
/// docker says "No such image", podman says "image not known"
fn is_missing_image(err: &RuntimeError) -> bool {
    let detail = err.detail().to_lowercase();
    detail.contains("no such image") || detail.contains("image not known")
}

pub fn build_run_args(spec: &RunSpec, flavor: RuntimeFlavor) -> Vec<OsString> {
    let mut out: Vec<OsString> = args(["run", "-d", "--name", spec.name.as_str()]);
    if flavor.supports_replace() {
        out.push("--replace".into());
    }
    out.push("-p".into());
    out.push(format!("{}:{}", spec.host_port, spec.internal_port).into());

    let mut volume = spec.volume_host.as_os_str().to_os_string();
    volume.push(":");
    volume.push(&spec.volume_container);
    out.push("-v".into());
    out.push(volume);

    for (key, value) in &spec.environment {
        out.push("-e".into());
        out.push(format!("{}={}", key, value).into());
    }
    for (host, target) in &spec.extra_hosts {
        out.push("--add-host".into());
        out.push(format!("{}:{}", host, target).into());
    }
    out.push("--memory".into());
    out.push(spec.memory.clone().into());
    out.push("--cpus".into());
    out.push(spec.cpus.clone().into());
    out.push(spec.image.clone().into());
    out
}

/// Docker prints one JSON object per line, Podman prints a JSON array
fn json_records(stdout: &str) -> Result<Vec<Value>, RuntimeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(RuntimeError::Parse("expected a JSON array".to_string())),
            Err(e) => Err(RuntimeError::Parse(e.to_string())),
        };
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| RuntimeError::Parse(e.to_string())))
        .collect()
}

fn string_field<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| record.get(*k).and_then(Value::as_str))
}

/// Names of local images as `name:tag`
pub fn parse_image_list(stdout: &str) -> Result<Vec<String>, RuntimeError> {
    let mut images = Vec::new();
    for record in json_records(stdout)? {
        if let Some(Value::Array(names)) = record.get("Names") {
            images.extend(names.iter().filter_map(Value::as_str).map(str::to_string));
            continue;
        }
        let repo = string_field(&record, &["Repository", "repository"]);
        let tag = string_field(&record, &["Tag", "tag"]);
        if let (Some(repo), Some(tag)) = (repo, tag) {
            if repo != "<none>" && tag != "<none>" {
                images.push(format!("{}:{}", repo, tag));
            }
        }
    }
    Ok(images)
}

/// Rows of `ps` output; `now` is the current unix time in seconds
pub fn parse_ps(stdout: &str, now: i64) -> Result<Vec<ContainerEntry>, RuntimeError> {
    let mut entries = Vec::new();
    for record in json_records(stdout)? {
        let names: Vec<String> = match record.get("Names") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s.split(',').map(|n| n.trim().to_string()).collect(),
            _ => Vec::new(),
        };
        let state = string_field(&record, &["State", "state"]).unwrap_or_default();
        let status_text = string_field(&record, &["Status", "status"])
            .unwrap_or(state)
            .to_string();
        let running = state.eq_ignore_ascii_case("running")
            || (state.is_empty() && status_text.starts_with("Up"));
        let image = string_field(&record, &["Image", "image"]).map(str::to_string);

        let uptime = if running {
            match record.get("StartedAt").and_then(Value::as_i64) {
                Some(started) if started > 0 && now >= started => {
                    Some(Duration::from_secs((now - started) as u64))
                }
                _ => parse_up_duration(&status_text),
            }
        } else {
            None
        };

        for name in names {
            entries.push(ContainerEntry {
                name: name.trim_start_matches('/').to_string(),
                running,
                status_text: status_text.clone(),
                image: image.clone(),
                uptime,
            });
        }
    }
    Ok(entries)
}

/// First row of `stats` output
pub fn parse_stats(stdout: &str) -> Result<ResourceSample, RuntimeError> {
    let records = json_records(stdout)?;
    let record = records
        .first()
        .ok_or_else(|| RuntimeError::Parse("empty stats output".to_string()))?;

    let cpu_percent = string_field(record, &["CPUPerc", "cpu_percent", "CPU"]).and_then(parse_percent);
    let memory_bytes = string_field(record, &["MemUsage", "mem_usage"])
        .and_then(|usage| usage.split('/').next())
        .and_then(parse_size);

    Ok(ResourceSample {
        memory_bytes,
        cpu_percent,
    })
}

/// Approximate uptime from a status like "Up 5 minutes (healthy)"
pub fn parse_up_duration(status: &str) -> Option<Duration> {
    let rest = status.trim().strip_prefix("Up ")?;
    let rest = rest.split(" (").next().unwrap_or(rest).trim();
    let lower = rest.to_lowercase();

    if lower.starts_with("less than a second") {
        return Some(Duration::ZERO);
    }

    let mut words = lower.split_whitespace();
    let amount = match words.next()? {
        "about" => {
            words.next();
            1
        }
        "a" | "an" => 1,
        n => n.parse().ok()?,
    };
    let unit = words.next()?;
    let secs = match unit.trim_end_matches('s') {
        "second" => 1,
        "minute" => 60,
        "hour" => 3600,
        "day" => 86_400,
        "week" => 604_800,
        "month" => 2_592_000,
        "year" => 31_536_000,
        _ => return None,
    };
    Some(Duration::from_secs(amount * secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunSpec {
        RunSpec {
            name: "open-webui".to_string(),
            image: "ghcr.io/open-webui/open-webui:main".to_string(),
            host_port: 3000,
            internal_port: 8080,
            volume_host: PathBuf::from("/data/webui"),
            volume_container: "/app/backend/data".to_string(),
            environment: vec![("A".to_string(), "1".to_string())],
            extra_hosts: vec![(
                "host.docker.internal".to_string(),
                "host-gateway".to_string(),
            )],
            memory: "2g".to_string(),
            cpus: "2".to_string(),
        }
    }

    fn strings(v: Vec<OsString>) -> Vec<String> {
        v.into_iter().map(|s| s.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn run_args_follow_the_contract() {
        let argv = strings(build_run_args(&spec(), RuntimeFlavor::Docker));
        assert_eq!(
            argv,
            vec![
                "run", "-d", "--name", "open-webui", "-p", "3000:8080", "-v",
                "/data/webui:/app/backend/data", "-e", "A=1", "--add-host",
                "host.docker.internal:host-gateway", "--memory", "2g", "--cpus", "2",
                "ghcr.io/open-webui/open-webui:main",
            ]
        );
    }

    #[test]
    fn podman_gets_replace_flag() {
        let argv = strings(build_run_args(&spec(), RuntimeFlavor::Podman));
        assert_eq!(argv[4], "--replace");
        assert!(!strings(build_run_args(&spec(), RuntimeFlavor::Docker)).contains(&"--replace".to_string()));
    }

    #[test]
    fn image_list_from_docker_json_lines() {
        let out = r#"{"Repository":"ghcr.io/open-webui/open-webui","Tag":"main","ID":"abc"}
{"Repository":"<none>","Tag":"<none>","ID":"def"}
{"Repository":"alpine","Tag":"3.19","ID":"123"}"#;
        assert_eq!(
            parse_image_list(out).unwrap(),
            vec!["ghcr.io/open-webui/open-webui:main", "alpine:3.19"]
        );
    }

    #[test]
    fn image_list_from_podman_array() {
        let out = r#"[{"Id":"abc","Names":["ghcr.io/open-webui/open-webui:main"]},{"Id":"x"}]"#;
        assert_eq!(
            parse_image_list(out).unwrap(),
            vec!["ghcr.io/open-webui/open-webui:main"]
        );
        assert!(parse_image_list("").unwrap().is_empty());
        assert!(parse_image_list("not json").is_err());
    }

    #[test]
    fn ps_from_docker_output() {
        let out = r#"{"Names":"open-webui","State":"running","Status":"Up 5 minutes (healthy)","Image":"ghcr.io/open-webui/open-webui:main"}
{"Names":"open-webui-old","State":"exited","Status":"Exited (0) 2 hours ago","Image":"x"}"#;
        let entries = parse_ps(out, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].running);
        assert_eq!(entries[0].uptime, Some(Duration::from_secs(300)));
        assert!(!entries[1].running);
        assert_eq!(entries[1].uptime, None);
    }

    #[test]
    fn ps_from_podman_output_uses_started_at() {
        let out = r#"[{"Names":["open-webui"],"State":"running","Status":"Up 1 minute","StartedAt":1000,"Image":"img"}]"#;
        let entries = parse_ps(out, 1090).unwrap();
        assert_eq!(entries[0].name, "open-webui");
        assert_eq!(entries[0].uptime, Some(Duration::from_secs(90)));
    }

    #[test]
    fn stats_from_both_runtimes() {
        let docker = r#"{"CPUPerc":"1.50%","MemUsage":"100MiB / 7.6GiB","Name":"open-webui"}"#;
        let sample = parse_stats(docker).unwrap();
        assert_eq!(sample.cpu_percent, Some(1.5));
        assert_eq!(sample.memory_bytes, Some(100 * 1024 * 1024));

        let podman = r#"[{"cpu_percent":"0.25%","mem_usage":"1GB / 8GB"}]"#;
        let sample = parse_stats(podman).unwrap();
        assert_eq!(sample.cpu_percent, Some(0.25));
        assert_eq!(sample.memory_bytes, Some(1024 * 1024 * 1024));

        assert!(parse_stats("").is_err());
    }

    #[test]
    fn up_durations() {
        assert_eq!(parse_up_duration("Up 5 seconds"), Some(Duration::from_secs(5)));
        assert_eq!(parse_up_duration("Up About a minute"), Some(Duration::from_secs(60)));
        assert_eq!(parse_up_duration("Up About an hour (healthy)"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_up_duration("Up 2 days"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_up_duration("Up Less than a second"), Some(Duration::ZERO));
        assert_eq!(parse_up_duration("Exited (0) 1 hour ago"), None);
    }

    #[test]
    fn missing_image_errors_from_both_runtimes() {
        let failed = |stderr: &str| RuntimeError::Failed {
            command: "docker image inspect".to_string(),
            code: Some(1),
            stderr: stderr.to_string(),
        };
        assert!(is_missing_image(&failed("Error: No such image: ghcr.io/open-webui/open-webui:main")));
        assert!(is_missing_image(&failed("Error: ghcr.io/open-webui/open-webui:main: image not known")));
        assert!(!is_missing_image(&failed("Cannot connect to the Docker daemon")));
    }
}
