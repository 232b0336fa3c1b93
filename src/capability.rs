//! # Host Layering Capabilities
//!
//! Detects, once per process, whether this host can build real union views:
//!
//! - `kernel_overlay`: the in-kernel overlay filesystem can be mounted
//! - `user_space_helper`: `fuse-overlayfs` can be mounted
//!
//! Detection is empirical. For each strategy a private scratch tree is
//! created, a view is mounted over it, and the mount is checked both ways:
//! a file in the lower layer must be visible through the merged view, and a
//! file written through the merged view must land in the upper layer. Any
//! failure clears only that flag; the probe itself never fails.
//!
//! [`CapabilityState::probe`] memoizes the result. Consumers take the
//! resulting value by copy instead of probing themselves, so tests can hand
//! in [`CapabilityState::none`] or an explicit value.

use crate::constants::{PROBE_DIR_PREFIX, PROBE_LOWER_MARKER, PROBE_UPPER_MARKER};
use crate::error::{Error, Result};
use crate::overlay::{
    FuseOverlay, KernelOverlay, LayerStrategy, OverlaySpec, StrategyKind, detach_unmount,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

static PROBED: OnceLock<CapabilityState> = OnceLock::new();

/// Union-mount capabilities of the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityState {
    /// Kernel overlay filesystem works.
    pub kernel_overlay: bool,
    /// User-space overlay helper works.
    pub user_space_helper: bool,
}

impl CapabilityState {
    /// No layering at all.
    pub const fn none() -> Self {
        Self {
            kernel_overlay: false,
            user_space_helper: false,
        }
    }

    /// Probes the host on first call; later calls return the same value.
    pub fn probe() -> Self {
        *PROBED.get_or_init(Self::detect)
    }

    /// Runs the probe with the default strategies, uncached.
    pub fn detect() -> Self {
        if !cfg!(target_os = "linux") {
            debug!("union mounts are only probed on Linux");
            return Self::none();
        }

        let strategies: Vec<Arc<dyn LayerStrategy>> = vec![
            Arc::new(KernelOverlay::default()),
            Arc::new(FuseOverlay::default()),
        ];
        let state = Self::detect_with(&strategies);
        info!(
            kernel_overlay = state.kernel_overlay,
            user_space_helper = state.user_space_helper,
            "probed layering capabilities"
        );
        state
    }

    /// Runs the probe against explicit strategies, uncached.
    ///
    /// A strategy that passes sets the flag for its [`StrategyKind`].
    pub fn detect_with(strategies: &[Arc<dyn LayerStrategy>]) -> Self {
        let mut state = Self::none();
        for strategy in strategies {
            let works = match probe_strategy(strategy.as_ref()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(strategy = %strategy.name(), error = %e, "layering probe failed");
                    false
                }
            };
            match strategy.kind() {
                StrategyKind::Kernel => state.kernel_overlay |= works,
                StrategyKind::UserSpace => state.user_space_helper |= works,
            }
        }
        state
    }

    /// Returns true if any real layering strategy is usable.
    pub fn has_layering(&self) -> bool {
        self.kernel_overlay || self.user_space_helper
    }
}

impl fmt::Display for CapabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kernel_overlay={} user_space_helper={}",
            self.kernel_overlay, self.user_space_helper
        )
    }
}

/// Mounts a scratch overlay with `strategy` and verifies both directions.
fn probe_strategy(strategy: &dyn LayerStrategy) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix(PROBE_DIR_PREFIX)
        .tempdir()?;
    let root = scratch.path();

    let lower = root.join("lower");
    let upper = root.join("upper");
    let work = root.join("work");
    let merged = root.join("merged");
    for dir in [&lower, &upper, &work, &merged] {
        fs::create_dir(dir)?;
    }
    fs::write(lower.join(PROBE_LOWER_MARKER), b"lower")?;

    let spec = OverlaySpec::new(&merged)
        .with_lower(&lower)
        .with_upper(&upper, &work);
    strategy.mount(&spec)?;

    let verified = verify_layers(&spec);

    if let Err(e) = strategy.unmount(&merged) {
        debug!(strategy = %strategy.name(), error = %e, "probe unmount failed, detaching");
        let _ = detach_unmount(&merged);
    }

    verified
}

fn verify_layers(spec: &OverlaySpec) -> Result<()> {
    if !spec.target.join(PROBE_LOWER_MARKER).is_file() {
        return Err(Error::Internal(
            "lower layer not visible through merged view".to_string(),
        ));
    }

    fs::write(spec.target.join(PROBE_UPPER_MARKER), b"upper")?;
    let landed = spec
        .upper
        .as_ref()
        .is_some_and(|upper| upper.join(PROBE_UPPER_MARKER).is_file());
    if !landed {
        return Err(Error::Internal(
            "write through merged view did not reach upper layer".to_string(),
        ));
    }
    Ok(())
}
