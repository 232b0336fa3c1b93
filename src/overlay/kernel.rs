//! In-kernel union filesystem via the `mount` command.

use super::{LayerStrategy, OverlaySpec, StrategyKind};
use crate::constants::{MOUNT_BIN, OVERLAY_FS_TYPE};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Kernel overlay filesystem.
#[derive(Debug, Clone)]
pub struct KernelOverlay {
    mount_bin: PathBuf,
}

impl Default for KernelOverlay {
    fn default() -> Self {
        Self {
            mount_bin: PathBuf::from(MOUNT_BIN),
        }
    }
}

impl KernelOverlay {
    /// Uses a specific `mount` binary.
    pub fn with_mount_bin(mount_bin: impl Into<PathBuf>) -> Self {
        Self {
            mount_bin: mount_bin.into(),
        }
    }
}

impl LayerStrategy for KernelOverlay {
    fn name(&self) -> &str {
        "kernel-overlay"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Kernel
    }

    fn mount(&self, spec: &OverlaySpec) -> Result<()> {
        let options = spec.mount_options();
        let output = Command::new(&self.mount_bin)
            .args(["-t", OVERLAY_FS_TYPE, OVERLAY_FS_TYPE, "-o", &options])
            .arg(&spec.target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::MountFailed {
                target: spec.target.clone(),
                reason: format!("{}: {}", self.mount_bin.display(), e),
            })?;

        if !output.status.success() {
            return Err(Error::MountFailed {
                target: spec.target.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        detach_unmount(target)
    }
}

/// Lazily detaches whatever is mounted at `target`.
///
/// A target with nothing mounted, or one that no longer exists, is not an
/// error. Any other refusal (no privilege, busy) is returned with the
/// kernel's reason.
#[cfg(target_os = "linux")]
pub fn detach_unmount(target: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_target = CString::new(target.as_os_str().as_bytes()).map_err(|e| Error::UnmountFailed {
        target: target.to_path_buf(),
        reason: e.to_string(),
    })?;

    // SAFETY: c_target is a valid NUL-terminated path that outlives the call.
    let rc = unsafe { libc::umount2(c_target.as_ptr(), libc::MNT_DETACH) };
    if rc != 0 {
        return detach_outcome(target, std::io::Error::last_os_error());
    }
    debug!(target = %target.display(), "detached mount");
    Ok(())
}

/// Classifies a failed `umount2`: only "not a mount point" and "no such
/// path" count as already unmounted.
#[cfg(target_os = "linux")]
fn detach_outcome(target: &Path, err: std::io::Error) -> Result<()> {
    match err.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ENOENT) => {
            debug!(target = %target.display(), error = %err, "nothing mounted to detach");
            Ok(())
        }
        _ => Err(Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn detach_unmount(target: &Path) -> Result<()> {
    if !is_mount_point(target)? {
        debug!(target = %target.display(), "nothing mounted to detach");
        return Ok(());
    }

    let output = Command::new("umount")
        .arg("-f")
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: format!("umount: {}", e),
        })?;
    if !output.status.success() {
        return Err(Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Returns true if a filesystem is mounted at `path`.
///
/// Compares the device of `path` with that of its parent, so a missing path
/// is simply not a mount point. Bind mounts of the same filesystem are not
/// detected; union mounts always present their own device.
#[cfg(unix)]
pub fn is_mount_point(path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Ok(false);
    }
    let parent = std::fs::metadata(path.join(".."))?;
    Ok(meta.dev() != parent.dev() || meta.ino() == parent.ino())
}

#[cfg(not(unix))]
pub fn is_mount_point(_path: &Path) -> Result<bool> {
    Ok(false)
}
