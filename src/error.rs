//! Error types for binary resolution, layered storage, and instance lifecycle.

use std::path::PathBuf;

/// Result type alias for polyrun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, composing, or running a server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Binary Format Errors
    // =========================================================================
    /// Leading bytes match none of the ELF, PE, or Mach-O magics.
    #[error("unsupported executable format: {path}")]
    UnsupportedFormat { path: String },

    /// Container magic matched but the header ended early.
    #[error("truncated {format} header in {path}")]
    TruncatedHeader { format: String, path: String },

    // =========================================================================
    // Emulation Errors
    // =========================================================================
    /// Current host OS has no known emulation path.
    #[error("no emulation path known for host {host}")]
    UnsupportedHost { host: String },

    /// No registry entry matches the target file.
    #[error("no compatible handler for {path} ({os}/{arch})")]
    NoCompatibleHandler {
        path: String,
        os: String,
        arch: String,
    },

    /// Handler definition violates the magic/mask invariant.
    #[error("invalid format handler '{arch}': {reason}")]
    InvalidHandler { arch: String, reason: String },

    /// A kernel format-registration descriptor could not be parsed.
    #[error("failed to parse descriptor '{name}': {reason}")]
    DescriptorParse { name: String, reason: String },

    /// Architecture or os/arch pair could not be interpreted.
    #[error("invalid platform '{0}'")]
    InvalidPlatform(String),

    // =========================================================================
    // Layering Errors
    // =========================================================================
    /// Capability probe found neither a kernel nor a user-space union mount.
    #[error("no union-mount strategy available on this host")]
    NoLayeringAvailable,

    /// Overlay description is incomplete.
    #[error("invalid overlay spec for {target}: {reason}")]
    InvalidOverlaySpec { target: PathBuf, reason: String },

    /// Every mount strategy failed.
    #[error("failed to mount {target}: {reason}")]
    MountFailed { target: PathBuf, reason: String },

    /// Unmount command failed.
    #[error("failed to unmount {target}: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },

    // =========================================================================
    // Software Overlay Errors
    // =========================================================================
    /// Relative path exists in none of the lower directories.
    #[error("path not found in any layer: {0}")]
    PathNotFound(PathBuf),

    /// Relative path escapes the layer root.
    #[error("path traversal rejected: {path}")]
    PathTraversal { path: String },

    /// Copying the merged view to disk failed.
    #[error("failed to materialize into {dest}: {reason}")]
    MaterializeFailed { dest: PathBuf, reason: String },

    // =========================================================================
    // Instance Lifecycle Errors
    // =========================================================================
    /// Version payload could not be located or fetched.
    #[error("failed to resolve version '{version}': {reason}")]
    VersionResolveFailed { version: String, reason: String },

    /// Instance ID is unusable as a directory name.
    #[error("invalid instance ID '{id}': {reason}")]
    InvalidInstanceId { id: String, reason: String },

    /// Instance is in the wrong state for the requested transition.
    #[error("instance '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Server process could not be spawned.
    #[error("failed to start instance '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure with no more specific variant, such as an unverified probe mount.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
