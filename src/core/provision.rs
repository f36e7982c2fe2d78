//! Provisioning - Making the runtime executable and the service image available
//!
//! Both steps share the same shape: a cheap `existing()` precondition check the
//! orchestrator uses to skip work, and a `provision()` that does the work while
//! reporting step progress in `[0, 1]`.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::bundle::Bundle;
use super::error::SetupError;
use super::process::CommandRunner;
use super::runtime::{RuntimeAdapter, RuntimePath, RuntimeSource};
use super::settings::RuntimeFlavor;
use crate::platform;

/// Step progress callback
pub type ProgressFn = dyn Fn(f64) + Send + Sync;

/// A provisioning step the orchestrator can skip when its precondition holds
#[async_trait]
pub trait ProvisionStep: Send + Sync {
    type Output: Send;

    /// Result of the step if it is already satisfied
    async fn existing(&self) -> Result<Option<Self::Output>, SetupError>;

    /// Do the work
    async fn provision(&self, progress: &ProgressFn) -> Result<Self::Output, SetupError>;

    /// Skip when satisfied, otherwise provision
    async fn ensure(&self, progress: &ProgressFn) -> Result<Self::Output, SetupError> {
        if let Some(output) = self.existing().await? {
            return Ok(output);
        }
        self.provision(progress).await
    }
}

/// Ensures a functional runtime executable exists
pub struct RuntimeProvisioner {
    flavor: RuntimeFlavor,
    managed_directory: PathBuf,
    bundle: Bundle,
    allow_system_runtime: bool,
    runner: CommandRunner,
}

impl RuntimeProvisioner {
    pub fn new(
        flavor: RuntimeFlavor,
        managed_directory: PathBuf,
        bundle: Bundle,
        allow_system_runtime: bool,
        runner: CommandRunner,
    ) -> Self {
        Self {
            flavor,
            managed_directory,
            bundle,
            allow_system_runtime,
            runner,
        }
    }

    /// Where the extracted runtime lives
    pub fn managed_path(&self) -> PathBuf {
        self.managed_directory.join(self.flavor.binary_name())
    }

    /// Invoke `--version` and require a well-formed answer
    async fn verify(&self, path: &Path) -> Result<String, SetupError> {
        let output = self
            .runner
            .run(path, &[OsString::from("--version")])
            .await
            .map_err(|e| SetupError::RuntimeExtractionFailed(e.detail()))?;

        let version = output.stdout.trim();
        if !version.to_lowercase().contains("version") {
            return Err(SetupError::RuntimeExtractionFailed(format!(
                "unexpected version output: {:?}",
                version
            )));
        }
        Ok(version.to_string())
    }

    async fn install(&self, payload: &Path, target: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.managed_directory).await?;
        tokio::fs::copy(payload, target).await?;
        platform::make_executable(target)
    }
}

#[async_trait]
impl ProvisionStep for RuntimeProvisioner {
    type Output = RuntimePath;

    async fn existing(&self) -> Result<Option<RuntimePath>, SetupError> {
        let managed = self.managed_path();
        if platform::is_executable(&managed) {
            match self.verify(&managed).await {
                Ok(version) => {
                    debug!("Managed runtime already present: {}", version);
                    return Ok(Some(RuntimePath {
                        path: managed,
                        version,
                        source: RuntimeSource::Managed,
                    }));
                }
                Err(e) => warn!("Managed runtime at {:?} is not functional: {}", managed, e),
            }
        }

        if self.allow_system_runtime {
            if let Some(system) = platform::find_in_path(self.flavor.binary_name()) {
                match self.verify(&system).await {
                    Ok(version) => {
                        info!("Using system runtime {:?} ({})", system, version);
                        return Ok(Some(RuntimePath {
                            path: system,
                            version,
                            source: RuntimeSource::System,
                        }));
                    }
                    Err(e) => debug!("System runtime {:?} rejected: {}", system, e),
                }
            }
        }

        Ok(None)
    }

    async fn provision(&self, progress: &ProgressFn) -> Result<RuntimePath, SetupError> {
        let payload = self.bundle.runtime_payload(self.flavor.binary_name());
        if !payload.is_file() {
            return Err(SetupError::BundledRuntimeMissing(payload));
        }
        progress(0.1);

        let target = self.managed_path();
        info!("Extracting runtime {:?} to {:?}", payload, target);

        // Transient I/O gets one retry; verification failures do not
        if let Err(first) = self.install(&payload, &target).await {
            warn!("Runtime extraction failed, retrying once: {}", first);
            self.install(&payload, &target).await.map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    SetupError::PermissionDenied(format!("{}: {}", target.display(), e))
                }
                _ => SetupError::RuntimeExtractionFailed(e.to_string()),
            })?;
        }
        progress(0.7);

        let version = self.verify(&target).await?;
        progress(1.0);
        info!("Runtime ready: {}", version);

        Ok(RuntimePath {
            path: target,
            version,
            source: RuntimeSource::Managed,
        })
    }
}

/// Where the service image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    AlreadyPresent,
    BundledArchive,
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub source: ImageSource,
}

/// Ensures the service image is present in the runtime's store
pub struct ImageProvisioner {
    runtime: Arc<dyn RuntimeAdapter>,
    image: String,
    bundle: Bundle,
    allow_registry_pull: bool,
}

impl ImageProvisioner {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        image: impl Into<String>,
        bundle: Bundle,
        allow_registry_pull: bool,
    ) -> Self {
        Self {
            runtime,
            image: image.into(),
            bundle,
            allow_registry_pull,
        }
    }

    async fn is_present(&self) -> bool {
        match self.runtime.list_images().await {
            Ok(images) => images_contain(&images, &self.image),
            Err(e) => {
                warn!("Could not list images: {}", e);
                false
            }
        }
    }

    async fn pull(&self, progress: &ProgressFn) -> Result<ImageRef, SetupError> {
        info!("Pulling {} from registry", self.image);
        progress(0.2);
        self.runtime
            .pull_image(&self.image)
            .await
            .map_err(|e| SetupError::from_pull_failure(&e, &self.image))?;
        progress(1.0);
        Ok(ImageRef {
            name: self.image.clone(),
            source: ImageSource::Registry,
        })
    }
}

#[async_trait]
impl ProvisionStep for ImageProvisioner {
    type Output = ImageRef;

    async fn existing(&self) -> Result<Option<ImageRef>, SetupError> {
        Ok(self.is_present().await.then(|| ImageRef {
            name: self.image.clone(),
            source: ImageSource::AlreadyPresent,
        }))
    }

    async fn provision(&self, progress: &ProgressFn) -> Result<ImageRef, SetupError> {
        let archive = self.bundle.image_archive();

        if archive.is_file() {
            progress(0.1);
            match self.runtime.load_image(&archive).await {
                Ok(()) if self.is_present().await => {
                    progress(1.0);
                    info!("Loaded {} from bundled archive", self.image);
                    return Ok(ImageRef {
                        name: self.image.clone(),
                        source: ImageSource::BundledArchive,
                    });
                }
                Ok(()) => warn!("Bundled archive {:?} did not contain {}", archive, self.image),
                Err(e) => warn!("Loading bundled archive {:?} failed: {}", archive, e),
            }
        } else {
            debug!("No bundled image archive at {:?}", archive);
        }

        if self.allow_registry_pull {
            self.pull(progress).await
        } else {
            Err(SetupError::BundledImageMissing(self.image.clone()))
        }
    }
}

/// Exact `name:tag` match; an untagged reference means `:latest`
pub fn images_contain(listing: &[String], image: &str) -> bool {
    let wanted = with_default_tag(image);
    listing.iter().any(|candidate| with_default_tag(candidate) == wanted)
}

fn with_default_tag(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || last_segment.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}
