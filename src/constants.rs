//! # Runtime Constants
//!
//! Defines host paths, naming conventions, limits, and timeouts used across
//! the resolver, layering, and instance layers. These constants are the
//! single source of truth for defaults; configuration structs start from
//! them and override selectively.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: binfmt directory, emulator and translator names
//! - [`crate::overlay`]: mount helpers and filesystem type
//! - [`crate::capability`]: probe directory layout
//! - [`crate::planner`]: instance directory layout and shutdown timing

use std::time::Duration;

// =============================================================================
// Kernel Format Registration
// =============================================================================
//
// binfmt_misc exposes one descriptor file per registered handler, plus the
// `register` and `status` control files which are never handlers.
// =============================================================================

/// Directory where the kernel publishes registered binary-format handlers.
pub const BINFMT_MISC_DIR: &str = "/proc/sys/fs/binfmt_misc";

/// Naming convention for emulator registrations (`qemu-aarch64`, ...).
///
/// The architecture tag is the registration name with this prefix removed.
pub const EMULATOR_PREFIX: &str = "qemu-";

/// Suffix of statically-linked user-mode emulator builds.
///
/// Static builds are preferred: they keep working inside a foreign rootfs
/// where the host's dynamic loader is not visible.
pub const STATIC_EMULATOR_SUFFIX: &str = "-static";

/// Maximum size of a single descriptor file read from the kernel.
pub const MAX_DESCRIPTOR_SIZE: u64 = 4096;

/// Maximum magic length the kernel accepts for a registration.
pub const MAX_MAGIC_LEN: usize = 128;

// =============================================================================
// Dynamic Translators
// =============================================================================

/// Fast dynamic translator for 64-bit x86 guests.
pub const X86_64_TRANSLATOR: &str = "box64";

/// Fast dynamic translator for 32-bit x86 guests.
pub const I386_TRANSLATOR: &str = "box86";

// =============================================================================
// Union Mount Helpers
// =============================================================================

/// Filesystem type passed to `mount -t` for kernel union mounts.
pub const OVERLAY_FS_TYPE: &str = "overlay";

/// Kernel mount command.
pub const MOUNT_BIN: &str = "mount";

/// User-space union-mount helper.
pub const FUSE_OVERLAY_BIN: &str = "fuse-overlayfs";

/// Graceful unmount commands for FUSE mounts, tried in order.
pub const FUSERMOUNT_BINS: &[&str] = &["fusermount3", "fusermount"];

/// Separator between lower directories in the mount options string.
pub const LOWERDIR_SEPARATOR: &str = ":";

// =============================================================================
// Sandboxed Rootfs Execution
// =============================================================================

/// Rootfs runner used when no handler can execute a payload directly.
pub const SANDBOX_RUNNER: &str = "proot";

/// Directory inside the sandbox rootfs where the payload is composed.
pub const SANDBOX_PAYLOAD_DIR: &str = "opt/server";

// =============================================================================
// Capability Probe
// =============================================================================

/// Prefix for the private temporary tree created by the capability probe.
pub const PROBE_DIR_PREFIX: &str = ".polyrun-probe-";

/// Marker file placed in the probe's lower layer.
pub const PROBE_LOWER_MARKER: &str = "lower-marker";

/// Marker file written through the probe's merged view.
pub const PROBE_UPPER_MARKER: &str = "upper-marker";

// =============================================================================
// Storage Layout
// =============================================================================
//
// ```text
// <root>/
// ├── versions/<version>/      immutable base install (one per version)
// └── instances/<id>/
//     ├── upper/               writable layer (instance state, preserved)
//     ├── work/                overlay scratch
//     └── merged/              composed environment root
// ```
// =============================================================================

/// Application directory name under the user's data directory.
pub const APP_DIR: &str = "polyrun";

/// Subdirectory for installed version payloads.
pub const VERSIONS_DIR: &str = "versions";

/// Subdirectory for per-instance state.
pub const INSTANCES_DIR: &str = "instances";

/// Writable layer directory inside an instance.
pub const UPPER_DIR: &str = "upper";

/// Overlay work directory inside an instance.
pub const WORK_DIR: &str = "work";

/// Composed environment root inside an instance.
pub const MERGED_DIR: &str = "merged";

/// Server executable path inside a payload, unless configured otherwise.
pub const DEFAULT_EXECUTABLE: &str = "server";

// =============================================================================
// Timeouts
// =============================================================================

/// Default grace period between the shutdown line and a forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Timeout for fetching a version payload through the download collaborator.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Line written to the server's stdin to request a graceful shutdown.
pub const DEFAULT_STOP_COMMAND: &str = "stop";

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for instance IDs and version names.
///
/// Excludes `/` so identifiers cannot escape their parent directory.
pub const NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum instance ID / version name length.
pub const MAX_NAME_LEN: usize = 128;

/// Validates an instance ID or version name for use as a directory name.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before using the name in a path"]
pub fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name exceeds maximum length");
    }
    if name == "." || name == ".." {
        return Err("name cannot be a relative directory reference");
    }
    if !name.chars().all(|c| NAME_VALID_CHARS.contains(c)) {
        return Err("name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("server-1.20.4").is_ok());
        assert!(validate_name("inst_01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
