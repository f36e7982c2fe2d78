//! Bundled resources - Offline runtime payload and image archive shipped with the app

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Manifest file name inside the bundle directory
pub const MANIFEST_FILE: &str = "bundle.json";

/// Conventional image archive name when no manifest names one
pub const DEFAULT_IMAGE_ARCHIVE: &str = "image.tar.gz";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleInfo {
    pub created_at: Option<String>,
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundledRuntime {
    pub name: String,
    pub version: String,
    pub size: u64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundledImage {
    pub name: String,
    pub size: u64,
    pub path: String,
    pub format: String,
}

/// Host requirements declared by the bundle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleRequirements {
    #[serde(rename = "macOSMinVersion")]
    pub macos_min_version: Option<String>,
    pub architectures: Vec<String>,
    #[serde(rename = "minimumMemoryGB")]
    pub minimum_memory_gb: Option<u64>,
    #[serde(rename = "minimumDiskSpaceGB")]
    pub minimum_disk_space_gb: Option<u64>,
}

/// Contents of `bundle.json`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleManifest {
    pub bundle_info: BundleInfo,
    pub runtime: Option<BundledRuntime>,
    pub container_image: Option<BundledImage>,
    pub requirements: Option<BundleRequirements>,
}

/// A bundle directory and its optional manifest
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    root: PathBuf,
    manifest: Option<BundleManifest>,
}

impl Bundle {
    /// Open a bundle directory. A missing or unreadable manifest falls back
    /// to conventional payload names.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = match std::fs::read_to_string(&manifest_path) {
            Ok(json) => match serde_json::from_str::<BundleManifest>(&json) {
                Ok(manifest) => {
                    debug!("Loaded bundle manifest from {:?}", manifest_path);
                    Some(manifest)
                }
                Err(e) => {
                    warn!("Ignoring malformed bundle manifest {:?}: {}", manifest_path, e);
                    None
                }
            },
            Err(_) => None,
        };
        Self { root, manifest }
    }

    pub fn with_manifest(root: impl Into<PathBuf>, manifest: BundleManifest) -> Self {
        Self {
            root: root.into(),
            manifest: Some(manifest),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> Option<&BundleManifest> {
        self.manifest.as_ref()
    }

    pub fn requirements(&self) -> Option<&BundleRequirements> {
        self.manifest.as_ref().and_then(|m| m.requirements.as_ref())
    }

    /// Location of the runtime executable payload
    pub fn runtime_payload(&self, binary_name: &str) -> PathBuf {
        match self
            .manifest
            .as_ref()
            .and_then(|m| m.runtime.as_ref())
            .filter(|r| !r.path.is_empty())
        {
            Some(runtime) => self.resolve(&runtime.path),
            None => self.root.join(binary_name),
        }
    }

    /// Location of the image archive
    pub fn image_archive(&self) -> PathBuf {
        match self
            .manifest
            .as_ref()
            .and_then(|m| m.container_image.as_ref())
            .filter(|i| !i.path.is_empty())
        {
            Some(image) => self.resolve(&image.path),
            None => self.root.join(DEFAULT_IMAGE_ARCHIVE),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "bundleInfo": {"createdAt": "2024-05-01T10:00:00Z", "architecture": "arm64"},
        "runtime": {"name": "podman", "version": "5.0.2", "size": 41234567, "path": "bin/podman"},
        "containerImage": {"name": "ghcr.io/open-webui/open-webui:main", "size": 1200000000,
                           "path": "images/open-webui.tar.gz", "format": "tar.gz"},
        "requirements": {"macOSMinVersion": "13.0", "architectures": ["arm64", "x86_64"],
                          "minimumMemoryGB": 8, "minimumDiskSpaceGB": 5}
    }"#;

    #[test]
    fn parses_manifest_schema() {
        let manifest: BundleManifest = serde_json::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.bundle_info.architecture.as_deref(), Some("arm64"));
        assert_eq!(manifest.runtime.as_ref().unwrap().version, "5.0.2");
        let requirements = manifest.requirements.unwrap();
        assert_eq!(requirements.macos_min_version.as_deref(), Some("13.0"));
        assert_eq!(requirements.minimum_memory_gb, Some(8));
        assert_eq!(requirements.minimum_disk_space_gb, Some(5));
        assert_eq!(requirements.architectures, vec!["arm64", "x86_64"]);
    }

    #[test]
    fn paths_resolve_relative_to_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), MANIFEST).unwrap();

        let bundle = Bundle::open(dir.path());
        assert!(bundle.manifest().is_some());
        assert_eq!(bundle.runtime_payload("docker"), dir.path().join("bin/podman"));
        assert_eq!(bundle.image_archive(), dir.path().join("images/open-webui.tar.gz"));
    }

    #[test]
    fn conventional_names_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();

        let bundle = Bundle::open(dir.path());
        assert!(bundle.manifest().is_none());
        assert_eq!(bundle.runtime_payload("docker"), dir.path().join("docker"));
        assert_eq!(bundle.image_archive(), dir.path().join(DEFAULT_IMAGE_ARCHIVE));
    }
}
