//! Server instance model and collaborator interfaces.
//!
//! An instance moves through a fixed lifecycle:
//!
//! ```text
//! Uninitialized → VersionResolved → EnvironmentComposed → Running → Stopped
//!                        ↑                   ↑                         │
//!                        └───────────────────┴─────────────────────────┘
//! ```
//!
//! A stopped instance can be composed again with the same payload, or
//! resolved against a new version. Any failed transition moves the instance
//! to `Failed`, from which only version resolution is allowed.
//!
//! Downloading a payload is not done here; callers provide a
//! [`PayloadSource`].

use crate::error::{Error, Result};
use crate::storage::SoftwareOverlay;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Instance Status
// =============================================================================

/// Lifecycle position of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Uninitialized,
    /// Payload for the requested version is on disk.
    VersionResolved,
    /// Execution strategy chosen and the layered root composed.
    EnvironmentComposed,
    Running,
    Stopped,
    /// A transition aborted; see `InstanceState::last_error`.
    Failed,
}

impl InstanceStatus {
    /// Returns true if `next` may follow `self`.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Uninitialized | Stopped | Failed, VersionResolved)
                | (VersionResolved | Stopped, EnvironmentComposed)
                | (EnvironmentComposed, Running)
                | (Running, Stopped)
                | (_, Failed)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::VersionResolved => write!(f, "version-resolved"),
            Self::EnvironmentComposed => write!(f, "environment-composed"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Execution Strategy
// =============================================================================

/// How the payload executable is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// Executed directly; the host or its kernel handles the format.
    Native,
    /// Command is prefixed with a user-mode emulator or translator.
    Emulated { interpreter: PathBuf },
    /// Run inside an alternate root through a rootfs runner.
    Sandboxed {
        rootfs: PathBuf,
        runner: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<PathBuf>,
    },
}

impl ExecutionStrategy {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Emulated { .. } => "emulated",
            Self::Sandboxed { .. } => "sandboxed",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Emulated { interpreter } => write!(f, "emulated via {}", interpreter.display()),
            Self::Sandboxed {
                rootfs,
                interpreter: Some(interpreter),
                ..
            } => write!(
                f,
                "sandboxed in {} via {}",
                rootfs.display(),
                interpreter.display()
            ),
            Self::Sandboxed { rootfs, .. } => write!(f, "sandboxed in {}", rootfs.display()),
        }
    }
}

// =============================================================================
// Instance State
// =============================================================================

/// Serializable snapshot of a server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub id: String,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExecutionStrategy>,
    /// Composed root the server runs in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// `mounted:<strategy>` or `materialized`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layering: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceState {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: InstanceStatus::Uninitialized,
            version: None,
            strategy: None,
            root: None,
            layering: None,
            pid: None,
            exit_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Moves to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: InstanceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                state: self.status.to_string(),
                expected: format!("a state that may precede {}", next),
            });
        }
        debug!(instance = %self.id, from = %self.status, to = %next, "instance transition");
        self.status = next;
        self.updated_at = Utc::now();
        if next != InstanceStatus::Failed {
            self.last_error = None;
        }
        Ok(())
    }

    /// Records a failed transition.
    pub fn fail(&mut self, error: &Error) {
        self.status = InstanceStatus::Failed;
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// =============================================================================
// Payload Source
// =============================================================================

/// Supplier of release payloads.
///
/// `download` must populate `target_dir`, which exists and is empty when
/// called. On error the caller removes `target_dir`.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Source name for logs.
    fn name(&self) -> &str;

    /// Fetches the payload for `version` into `target_dir`.
    async fn download(&self, version: &str, target_dir: &Path) -> Result<()>;
}

/// Payloads already unpacked under `<root>/<version>`.
#[derive(Debug, Clone)]
pub struct LocalPayloadSource {
    root: PathBuf,
}

impl LocalPayloadSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PayloadSource for LocalPayloadSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn download(&self, version: &str, target_dir: &Path) -> Result<()> {
        let release = self.root.join(version);
        if !release.is_dir() {
            return Err(Error::VersionResolveFailed {
                version: version.to_string(),
                reason: format!("no release at {}", release.display()),
            });
        }

        let view = SoftwareOverlay::new(vec![release]);
        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || view.materialize(&target))
            .await
            .map_err(|e| Error::Internal(format!("copy task failed: {}", e)))??;
        Ok(())
    }
}
