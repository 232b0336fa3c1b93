//! # Union Mounts
//!
//! Presents one or more read-only lower directories plus an optional
//! writable upper directory as a single view at a target mount point.
//!
//! ## Strategies
//!
//! Each way of building a union view implements [`LayerStrategy`].
//! [`OverlayMount`] holds an ordered list of them, built from the host's
//! [`CapabilityState`], and tries them in order until one succeeds:
//!
//! | Order | Strategy        | Mount                         | Unmount                       |
//! |-------|-----------------|-------------------------------|-------------------------------|
//! | 1     | [`KernelOverlay`] | `mount -t overlay`          | detached `umount2`            |
//! | 2     | [`FuseOverlay`]   | `fuse-overlayfs`            | `fusermount3 -u` / `fusermount -u`, then detached `umount2` |
//!
//! An empty list means no real layering exists on this host; callers fall
//! back to [`crate::storage::SoftwareOverlay`].
//!
//! ## Ownership
//!
//! A target has a single owner. Mount and unmount of the same target must be
//! serialized by the caller; [`MountHandle`] is the token that proves a
//! target was mounted and records which strategy did it.
//!
//! ## Mount Options
//!
//! ```text
//! lowerdir=<A>:<B>:...,upperdir=<U>,workdir=<W>
//! ```
//!
//! Lower directories are listed highest precedence first. `upperdir` and
//! `workdir` are omitted together for read-only views.

mod fuse;
mod kernel;

pub use self::fuse::FuseOverlay;
pub use self::kernel::{KernelOverlay, detach_unmount, is_mount_point};

use crate::capability::CapabilityState;
use crate::constants::LOWERDIR_SEPARATOR;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Overlay Spec
// =============================================================================

/// Layout of one union view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySpec {
    /// Mount point presenting the merged view.
    pub target: PathBuf,
    /// Read-only layers, highest precedence first.
    pub lower: Vec<PathBuf>,
    /// Writable layer; all writes under `target` land here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<PathBuf>,
    /// Scratch directory, required whenever `upper` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<PathBuf>,
}

impl OverlaySpec {
    /// Creates a spec with no layers yet.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            lower: Vec::new(),
            upper: None,
            work: None,
        }
    }

    /// Appends a lower layer below the existing ones.
    pub fn with_lower(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lower.push(dir.into());
        self
    }

    /// Sets the writable layer and its work directory.
    pub fn with_upper(mut self, upper: impl Into<PathBuf>, work: impl Into<PathBuf>) -> Self {
        self.upper = Some(upper.into());
        self.work = Some(work.into());
        self
    }

    /// Returns true if the view has no writable layer.
    pub fn is_read_only(&self) -> bool {
        self.upper.is_none()
    }

    /// Checks the structural invariants.
    ///
    /// At least one lower directory; `work` whenever `upper` is set; no path
    /// containing the option separators `:` or `,`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidOverlaySpec {
            target: self.target.clone(),
            reason: reason.to_string(),
        };

        if self.lower.is_empty() {
            return Err(invalid("at least one lower directory is required"));
        }
        if self.upper.is_some() && self.work.is_none() {
            return Err(invalid("upper directory requires a work directory"));
        }
        if self.upper.is_none() && self.work.is_some() {
            return Err(invalid("work directory given without an upper directory"));
        }

        let all = self
            .lower
            .iter()
            .chain(self.upper.iter())
            .chain(self.work.iter());
        for path in all {
            let s = path.to_string_lossy();
            if s.is_empty() {
                return Err(invalid("empty layer path"));
            }
            if s.contains(LOWERDIR_SEPARATOR) || s.contains(',') {
                return Err(invalid(&format!(
                    "layer path contains an option separator: {}",
                    s
                )));
            }
        }
        Ok(())
    }

    /// Checks that every directory the mount needs already exists.
    fn check_directories(&self) -> Result<()> {
        let required = std::iter::once(&self.target)
            .chain(self.lower.iter())
            .chain(self.upper.iter())
            .chain(self.work.iter());
        for dir in required {
            if !dir.is_dir() {
                return Err(Error::InvalidOverlaySpec {
                    target: self.target.clone(),
                    reason: format!("directory does not exist: {}", dir.display()),
                });
            }
        }
        Ok(())
    }

    /// Builds the mount options string.
    pub fn mount_options(&self) -> String {
        let lower = self
            .lower
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(LOWERDIR_SEPARATOR);

        match (&self.upper, &self.work) {
            (Some(upper), Some(work)) => format!(
                "lowerdir={},upperdir={},workdir={}",
                lower,
                upper.display(),
                work.display()
            ),
            _ => format!("lowerdir={}", lower),
        }
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Family of a layering strategy; decides the unmount fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// In-kernel union filesystem.
    Kernel,
    /// User-space (FUSE) helper process.
    UserSpace,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => write!(f, "kernel"),
            Self::UserSpace => write!(f, "user-space"),
        }
    }
}

/// One way of composing a union view.
pub trait LayerStrategy: Send + Sync + fmt::Debug {
    /// Strategy name for logs.
    fn name(&self) -> &str;

    /// Strategy family.
    fn kind(&self) -> StrategyKind;

    /// Mounts `spec.target`. Directories are already validated.
    fn mount(&self, spec: &OverlaySpec) -> Result<()>;

    /// Graceful unmount of `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Proof that a target is mounted, and by which strategy.
#[derive(Debug, Clone)]
pub struct MountHandle {
    target: PathBuf,
    strategy: Arc<dyn LayerStrategy>,
}

impl MountHandle {
    /// Mounted target.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Name of the strategy that performed the mount.
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Family of the strategy that performed the mount.
    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }
}

// =============================================================================
// Overlay Mount
// =============================================================================

/// Mounts and unmounts union views using the first working strategy.
#[derive(Debug, Clone)]
pub struct OverlayMount {
    strategies: Vec<Arc<dyn LayerStrategy>>,
}

impl OverlayMount {
    /// Builds the strategy list the capability value allows.
    pub fn new(capabilities: CapabilityState) -> Self {
        let mut strategies: Vec<Arc<dyn LayerStrategy>> = Vec::new();
        if capabilities.kernel_overlay {
            strategies.push(Arc::new(KernelOverlay::default()));
        }
        if capabilities.user_space_helper {
            strategies.push(Arc::new(FuseOverlay::default()));
        }
        Self { strategies }
    }

    /// Uses an explicit ordered strategy list.
    pub fn with_strategies(strategies: Vec<Arc<dyn LayerStrategy>>) -> Self {
        Self { strategies }
    }

    /// Returns true if at least one strategy is configured.
    pub fn is_available(&self) -> bool {
        !self.strategies.is_empty()
    }

    /// Strategies in the order they are tried.
    pub fn strategies(&self) -> &[Arc<dyn LayerStrategy>] {
        &self.strategies
    }

    /// Mounts the union view described by `spec`.
    ///
    /// The target, and the upper/work directories when used, must already
    /// exist as empty directories.
    pub fn mount(&self, spec: &OverlaySpec) -> Result<MountHandle> {
        spec.validate()?;
        if self.strategies.is_empty() {
            return Err(Error::NoLayeringAvailable);
        }
        spec.check_directories()?;

        debug!(
            target = %spec.target.display(),
            options = %spec.mount_options(),
            "mounting union view"
        );

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match strategy.mount(spec) {
                Ok(()) => {
                    info!(
                        target = %spec.target.display(),
                        strategy = %strategy.name(),
                        layers = spec.lower.len(),
                        writable = !spec.is_read_only(),
                        "union view mounted"
                    );
                    return Ok(MountHandle {
                        target: spec.target.clone(),
                        strategy: Arc::clone(strategy),
                    });
                }
                Err(e) => {
                    warn!(
                        target = %spec.target.display(),
                        strategy = %strategy.name(),
                        error = %e,
                        "mount strategy failed"
                    );
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        Err(Error::MountFailed {
            target: spec.target.clone(),
            reason: failures.join("; "),
        })
    }

    /// Unmounts a view mounted by [`OverlayMount::mount`].
    ///
    /// The mounting strategy's own unmount runs first. For helper mounts a
    /// failure there falls back to a detached kernel unmount, which succeeds
    /// when nothing is mounted any more; every other failure is returned
    /// with the reasons attached.
    pub fn unmount(&self, handle: MountHandle) -> Result<()> {
        let target = handle.target();

        let failure = match handle.strategy.unmount(target) {
            Ok(()) => {
                info!(target = %target.display(), strategy = %handle.strategy_name(), "union view unmounted");
                return Ok(());
            }
            Err(e) => e,
        };

        if handle.kind() == StrategyKind::Kernel {
            return Err(failure);
        }

        warn!(target = %target.display(), error = %failure, "helper unmount failed, detaching");
        detach_unmount(target).map_err(|detach| Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: format!("{}; {}", failure, detach),
        })?;
        info!(target = %target.display(), "union view detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options_read_only() {
        let spec = OverlaySpec::new("/mnt/merged")
            .with_lower("/layers/a")
            .with_lower("/layers/b");
        assert_eq!(spec.mount_options(), "lowerdir=/layers/a:/layers/b");
        assert!(spec.is_read_only());
    }

    #[test]
    fn test_mount_options_writable() {
        let spec = OverlaySpec::new("/mnt/merged")
            .with_lower("/layers/a")
            .with_upper("/inst/upper", "/inst/work");
        assert_eq!(
            spec.mount_options(),
            "lowerdir=/layers/a,upperdir=/inst/upper,workdir=/inst/work"
        );
    }

    #[test]
    fn test_validate_requires_lower() {
        let err = OverlaySpec::new("/mnt/merged").validate().unwrap_err();
        assert!(matches!(err, Error::InvalidOverlaySpec { .. }));
    }

    #[test]
    fn test_validate_upper_requires_work() {
        let mut spec = OverlaySpec::new("/mnt/merged").with_lower("/layers/a");
        spec.upper = Some(PathBuf::from("/inst/upper"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_separator_in_path() {
        let spec = OverlaySpec::new("/mnt/merged").with_lower("/layers/a:b");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_no_strategies_means_no_layering() {
        let mount = OverlayMount::new(CapabilityState::none());
        assert!(!mount.is_available());
        let spec = OverlaySpec::new("/mnt/merged").with_lower("/layers/a");
        assert!(matches!(
            mount.mount(&spec).unwrap_err(),
            Error::NoLayeringAvailable
        ));
    }
}
