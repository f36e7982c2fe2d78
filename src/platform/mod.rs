//! Platform-specific helpers for host inspection and file permissions

use std::io;
use std::path::{Path, PathBuf};

/// Mark a file as executable by its owner, group and others
pub fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)
    }
    #[cfg(not(unix))]
    {
        std::fs::metadata(path).map(|_| ())
    }
}

/// Check whether a file exists and carries an executable bit
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Free space in bytes on the filesystem holding `path`
pub fn available_disk_space(path: &Path) -> io::Result<u64> {
    let probe = existing_ancestor(path);

    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(probe.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
    #[cfg(not(unix))]
    {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|d| probe.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no disk for path"))
    }
}

/// Closest ancestor of `path` that exists, so fresh installs can be measured
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    loop {
        if current.exists() {
            return current;
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent.to_path_buf(),
            _ => return PathBuf::from("/"),
        }
    }
}

/// OS family name ("macos", "linux", ...)
pub fn os_family() -> &'static str {
    std::env::consts::OS
}

/// OS version as reported by the host, e.g. "14.2.1"
pub fn os_version() -> Option<String> {
    sysinfo::System::os_version()
}

/// Host CPU architecture using the names bundle manifests use
pub fn architecture() -> String {
    normalize_architecture(std::env::consts::ARCH)
}

pub fn normalize_architecture(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "aarch64" | "arm64" => "arm64".to_string(),
        "x86_64" | "amd64" | "x64" => "x86_64".to_string(),
        other => other.to_string(),
    }
}

/// Search the PATH for an executable by name
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}
