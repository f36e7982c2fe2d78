//! System requirements - Host capability checks run before provisioning

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bundle::BundleRequirements;
use super::error::SetupError;
use super::resource::{bytes_to_gb, GIB};
use crate::platform;

/// Local host queries used by the checker and diagnostics
pub trait HostProbe: Send + Sync {
    fn os_family(&self) -> String;
    fn os_version(&self) -> Option<String>;
    fn architecture(&self) -> String;
    fn total_memory(&self) -> u64;
    fn available_disk(&self, path: &Path) -> io::Result<u64>;
}

/// [`HostProbe`] backed by sysinfo and statvfs
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl HostProbe for SysinfoProbe {
    fn os_family(&self) -> String {
        platform::os_family().to_string()
    }

    fn os_version(&self) -> Option<String> {
        platform::os_version()
    }

    fn architecture(&self) -> String {
        platform::architecture()
    }

    fn total_memory(&self) -> u64 {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.total_memory()
    }

    fn available_disk(&self, path: &Path) -> io::Result<u64> {
        platform::available_disk_space(path)
    }
}

/// Thresholds a host must meet
#[derive(Debug, Clone, PartialEq)]
pub struct Requirements {
    pub min_macos_version: String,
    pub min_memory_bytes: u64,
    pub min_disk_bytes: u64,
    /// Accepted architectures; empty accepts any
    pub architectures: Vec<String>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            min_macos_version: "12.0".to_string(),
            min_memory_bytes: 4 * GIB,
            min_disk_bytes: 3 * GIB,
            architectures: Vec::new(),
        }
    }
}

impl Requirements {
    /// Defaults overridden by whatever the bundle declares
    pub fn from_bundle(declared: Option<&BundleRequirements>) -> Self {
        let mut requirements = Self::default();
        if let Some(declared) = declared {
            if let Some(version) = declared.macos_min_version.as_ref().filter(|v| !v.is_empty()) {
                requirements.min_macos_version = version.clone();
            }
            if let Some(gb) = declared.minimum_memory_gb {
                requirements.min_memory_bytes = gb.saturating_mul(GIB);
            }
            if let Some(gb) = declared.minimum_disk_space_gb {
                requirements.min_disk_bytes = gb.saturating_mul(GIB);
            }
            requirements.architectures = declared
                .architectures
                .iter()
                .map(|a| platform::normalize_architecture(a))
                .collect();
        }
        requirements
    }
}

/// Facts measured during a successful check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub os_family: String,
    pub os_version: Option<String>,
    pub architecture: String,
    pub total_memory: u64,
    pub available_disk_space: u64,
}

pub struct SystemRequirementsChecker {
    probe: Arc<dyn HostProbe>,
    requirements: Requirements,
    data_directory: PathBuf,
}

impl SystemRequirementsChecker {
    pub fn new(probe: Arc<dyn HostProbe>, requirements: Requirements, data_directory: PathBuf) -> Self {
        Self {
            probe,
            requirements,
            data_directory,
        }
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    /// Validate the host. Read-only; only local system queries.
    pub fn check(&self) -> Result<HostFacts, SetupError> {
        let os_family = self.probe.os_family();
        let os_version = self.probe.os_version();

        match os_family.as_str() {
            "macos" => {
                let version = os_version.as_deref().unwrap_or("0");
                if !version_at_least(version, &self.requirements.min_macos_version) {
                    return Err(SetupError::UnsupportedSystem(format!(
                        "macOS {} or later is required, found {}",
                        self.requirements.min_macos_version, version
                    )));
                }
            }
            "linux" => {}
            other => {
                return Err(SetupError::UnsupportedSystem(format!(
                    "{} is not a supported operating system",
                    other
                )))
            }
        }

        let architecture = platform::normalize_architecture(&self.probe.architecture());
        if !self.requirements.architectures.is_empty()
            && !self.requirements.architectures.contains(&architecture)
        {
            return Err(SetupError::UnsupportedSystem(format!(
                "architecture {} is not supported (bundle supports {})",
                architecture,
                self.requirements.architectures.join(", ")
            )));
        }

        let available_disk_space = self
            .probe
            .available_disk(&self.data_directory)
            .map_err(|e| SetupError::Unknown(format!("could not measure free disk space: {}", e)))?;
        if available_disk_space < self.requirements.min_disk_bytes {
            return Err(SetupError::InsufficientDiskSpace {
                required_gb: bytes_to_gb(self.requirements.min_disk_bytes),
                available_gb: bytes_to_gb(available_disk_space),
            });
        }

        let total_memory = self.probe.total_memory();
        if total_memory < self.requirements.min_memory_bytes {
            return Err(SetupError::InsufficientMemory {
                required_gb: bytes_to_gb(self.requirements.min_memory_bytes),
                available_gb: bytes_to_gb(total_memory),
            });
        }

        debug!(
            "Host {} {:?} {} with {:.1} GB memory, {:.1} GB free",
            os_family,
            os_version,
            architecture,
            bytes_to_gb(total_memory),
            bytes_to_gb(available_disk_space)
        );
        info!("System requirements satisfied");

        Ok(HostFacts {
            os_family,
            os_version,
            architecture,
            total_memory,
            available_disk_space,
        })
    }
}

/// Dotted version comparison, missing components count as zero
pub fn version_at_least(actual: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> {
        v.trim()
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(actual), parse(minimum));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        if x != y {
            return x > y;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::FakeHost;

    fn checker(host: FakeHost) -> SystemRequirementsChecker {
        SystemRequirementsChecker::new(Arc::new(host), Requirements::default(), PathBuf::from("/data"))
    }

    #[test]
    fn capable_host_passes() {
        let facts = checker(FakeHost::capable()).check().unwrap();
        assert_eq!(facts.os_family, "macos");
        assert_eq!(facts.total_memory, 16 * GIB);
    }

    #[test]
    fn low_disk_reports_both_values() {
        let host = FakeHost {
            disk: GIB,
            ..FakeHost::capable()
        };
        let err = checker(host).check().unwrap_err();
        assert_eq!(
            err,
            SetupError::InsufficientDiskSpace {
                required_gb: 3.0,
                available_gb: 1.0
            }
        );
        let message = err.user_message();
        assert!(message.contains("1.0"));
        assert!(message.contains("3.0"));
    }

    #[test]
    fn low_memory_fails() {
        let host = FakeHost {
            memory: 2 * GIB,
            ..FakeHost::capable()
        };
        assert_eq!(checker(host).check().unwrap_err().kind(), "InsufficientMemory");
    }

    #[test]
    fn old_macos_and_unknown_os_are_unsupported() {
        let host = FakeHost {
            version: Some("11.7.10".to_string()),
            ..FakeHost::capable()
        };
        assert_eq!(checker(host).check().unwrap_err().kind(), "UnsupportedSystem");

        let host = FakeHost {
            family: "windows".to_string(),
            ..FakeHost::capable()
        };
        assert_eq!(checker(host).check().unwrap_err().kind(), "UnsupportedSystem");

        let host = FakeHost {
            family: "linux".to_string(),
            version: None,
            ..FakeHost::capable()
        };
        assert!(checker(host).check().is_ok());
    }

    #[test]
    fn bundle_overrides_thresholds_and_architectures() {
        let declared = BundleRequirements {
            macos_min_version: Some("13.0".to_string()),
            architectures: vec!["aarch64".to_string()],
            minimum_memory_gb: Some(8),
            minimum_disk_space_gb: Some(10),
        };
        let requirements = Requirements::from_bundle(Some(&declared));
        assert_eq!(requirements.min_disk_bytes, 10 * GIB);
        assert_eq!(requirements.architectures, vec!["arm64"]);

        let host = FakeHost {
            arch: "x86_64".to_string(),
            ..FakeHost::capable()
        };
        let checker = SystemRequirementsChecker::new(Arc::new(host), requirements, PathBuf::from("/"));
        assert_eq!(checker.check().unwrap_err().kind(), "UnsupportedSystem");
    }

    #[test]
    fn oversized_bundle_thresholds_clamp_instead_of_wrapping() {
        let declared = BundleRequirements {
            minimum_memory_gb: Some(u64::MAX / 2),
            minimum_disk_space_gb: Some(u64::MAX),
            ..Default::default()
        };
        let requirements = Requirements::from_bundle(Some(&declared));
        assert_eq!(requirements.min_memory_bytes, u64::MAX);
        assert_eq!(requirements.min_disk_bytes, u64::MAX);

        let checker = SystemRequirementsChecker::new(Arc::new(FakeHost::capable()), requirements, PathBuf::from("/"));
        assert_eq!(checker.check().unwrap_err().kind(), "InsufficientDiskSpace");
    }

    #[test]
    fn version_comparison() {
        assert!(version_at_least("12.0", "12.0"));
        assert!(version_at_least("14.2.1", "12.0"));
        assert!(version_at_least("12", "12.0.0"));
        assert!(!version_at_least("11.7", "12.0"));
        assert!(!version_at_least("12.0", "12.0.1"));
    }
}
