//! User-space union mounts through `fuse-overlayfs`.

use super::{LayerStrategy, OverlaySpec, StrategyKind};
use crate::constants::{FUSE_OVERLAY_BIN, FUSERMOUNT_BINS};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// FUSE overlay helper.
#[derive(Debug, Clone)]
pub struct FuseOverlay {
    helper: PathBuf,
    fusermount: Vec<PathBuf>,
}

impl Default for FuseOverlay {
    fn default() -> Self {
        Self {
            helper: PathBuf::from(FUSE_OVERLAY_BIN),
            fusermount: FUSERMOUNT_BINS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl FuseOverlay {
    /// Uses specific helper and unmount binaries.
    pub fn with_binaries(helper: impl Into<PathBuf>, fusermount: Vec<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            fusermount,
        }
    }
}

impl LayerStrategy for FuseOverlay {
    fn name(&self) -> &str {
        "fuse-overlayfs"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::UserSpace
    }

    fn mount(&self, spec: &OverlaySpec) -> Result<()> {
        let output = Command::new(&self.helper)
            .arg("-o")
            .arg(spec.mount_options())
            .arg(&spec.target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::MountFailed {
                target: spec.target.clone(),
                reason: format!("{}: {}", self.helper.display(), e),
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
        let mut failures = Vec::new();
        for bin in &self.fusermount {
            match Command::new(bin)
                .arg("-u")
                .arg(target)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
            {
                Ok(output) if output.status.success() => {
                    debug!(target = %target.display(), helper = %bin.display(), "helper unmounted");
                    return Ok(());
                }
                Ok(output) => failures.push(format!(
                    "{}: {}",
                    bin.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
                Err(e) => failures.push(format!("{}: {}", bin.display(), e)),
            }
        }

        Err(Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: failures.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unmount_without_helpers_fails_with_reasons() {
        let dir = TempDir::new().unwrap();
        let strategy = FuseOverlay::with_binaries(
            dir.path().join("fuse-overlayfs"),
            vec![dir.path().join("fusermount3"), dir.path().join("fusermount")],
        );
        let err = strategy.unmount(dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("fusermount3"));
        assert!(msg.contains("fusermount"));
    }
}
