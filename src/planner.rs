//! # Execution Planning
//!
//! Ties format resolution and layered storage together for one server
//! instance at a time.
//!
//! ## Directory Layout
//!
//! ```text
//! <versions_root>/<version>/        base install (never written)
//! <instances_root>/<id>/upper/      instance writes
//! <instances_root>/<id>/work/       overlay scratch
//! <instances_root>/<id>/merged/     composed root the server runs in
//! ```
//!
//! ## Composition
//!
//! With a working union mount the composed root is a live view of
//! `[upper, payload]`: [`Composition::Mounted`], unmounted when the server
//! stops. Without one the view is materialized by copying into `merged`:
//! [`Composition::Materialized`]. A materialized root is left on disk when
//! the server stops; the caller keeps its changes with
//! [`ServerInstance::write_back`] or drops them with
//! [`ServerInstance::discard_materialized`] before composing again. Either
//! way the base install is never modified.
//!
//! ## Strategy Selection
//!
//! | Resolution                      | Rootfs configured | Strategy      |
//! |---------------------------------|-------------------|---------------|
//! | handler with auto-dispatch      | any               | `Native`      |
//! | handler that needs wrapping     | no                | `Emulated`    |
//! | handler that needs wrapping     | yes               | `Sandboxed`   |
//! | no handler                      | yes               | `Sandboxed`   |
//! | no handler                      | no                | error         |
//!
//! ## Example
//!
//! ```rust,ignore
//! let planner = ExecutionPlanner::new(config, resolver, CapabilityState::probe());
//! let mut instance = planner.instance("survival")?;
//! instance.resolve_version("1.21.0", &source).await?;
//! instance.compose_environment()?;
//! instance.start().await?;
//! // ...
//! instance.stop(DEFAULT_GRACE_PERIOD).await?;
//! ```

use crate::capability::CapabilityState;
use crate::constants::{
    APP_DIR, DEFAULT_EXECUTABLE, DEFAULT_GRACE_PERIOD, DEFAULT_STOP_COMMAND, DOWNLOAD_TIMEOUT,
    INSTANCES_DIR, MERGED_DIR, SANDBOX_PAYLOAD_DIR, SANDBOX_RUNNER, UPPER_DIR, VERSIONS_DIR,
    WORK_DIR, validate_name,
};
use crate::error::{Error, Result};
use crate::handler::FormatHandler;
use crate::inspect::inspect;
use crate::overlay::{MountHandle, OverlayMount, OverlaySpec, detach_unmount, is_mount_point};
use crate::registry::which;
use crate::resolver::FormatResolver;
use crate::runtime::{ExecutionStrategy, InstanceState, InstanceStatus, PayloadSource};
use crate::storage::{self, MaterializeStats, SoftwareOverlay, sanitize_relative};
use crate::supervisor::{ServerProcess, StopOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Directory holding one base install per version.
    pub versions_root: PathBuf,
    /// Directory holding per-instance state.
    pub instances_root: PathBuf,
    /// Server executable, relative to the payload root.
    pub executable: PathBuf,
    /// Arguments passed to the server.
    pub args: Vec<String>,
    /// Console line requesting a graceful shutdown.
    pub stop_command: String,
    pub grace_period_secs: u64,
    pub download_timeout_secs: u64,
    /// Foreign root filesystems by architecture tag.
    pub rootfs: BTreeMap<String, PathBuf>,
    /// Rootfs runner, by name on `search_path` or absolute.
    pub sandbox_runner: PathBuf,
    pub search_path: Vec<PathBuf>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();

        Self {
            versions_root: data_dir.join(VERSIONS_DIR),
            instances_root: data_dir.join(INSTANCES_DIR),
            executable: PathBuf::from(DEFAULT_EXECUTABLE),
            args: Vec::new(),
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
            grace_period_secs: DEFAULT_GRACE_PERIOD.as_secs(),
            download_timeout_secs: DOWNLOAD_TIMEOUT.as_secs(),
            rootfs: BTreeMap::new(),
            sandbox_runner: PathBuf::from(SANDBOX_RUNNER),
            search_path,
        }
    }
}

impl PlannerConfig {
    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Places versions and instances under one root.
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        self.versions_root = root.as_ref().join(VERSIONS_DIR);
        self.instances_root = root.as_ref().join(INSTANCES_DIR);
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_stop_command(mut self, line: impl Into<String>) -> Self {
        self.stop_command = line.into();
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_secs = grace.as_secs();
        self
    }

    /// Registers a root filesystem for an architecture.
    pub fn with_rootfs(mut self, arch: impl Into<String>, rootfs: impl Into<PathBuf>) -> Self {
        self.rootfs.insert(arch.into(), rootfs.into());
        self
    }

    pub fn with_sandbox_runner(mut self, runner: impl Into<PathBuf>) -> Self {
        self.sandbox_runner = runner.into();
        self
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    fn runner_path(&self) -> Option<PathBuf> {
        if self.sandbox_runner.is_absolute() {
            return self
                .sandbox_runner
                .is_file()
                .then(|| self.sandbox_runner.clone());
        }
        which(&self.sandbox_runner.to_string_lossy(), &self.search_path)
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Creates server instances sharing one resolver and capability value.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    config: Arc<PlannerConfig>,
    resolver: Arc<FormatResolver>,
    capabilities: CapabilityState,
    overlay: OverlayMount,
}

impl ExecutionPlanner {
    pub fn new(
        config: PlannerConfig,
        resolver: FormatResolver,
        capabilities: CapabilityState,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver: Arc::new(resolver),
            capabilities,
            overlay: OverlayMount::new(capabilities),
        }
    }

    /// Replaces the union-mount strategies.
    pub fn with_overlay(mut self, overlay: OverlayMount) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> CapabilityState {
        self.capabilities
    }

    /// Creates a handle for instance `id`.
    pub fn instance(&self, id: &str) -> Result<ServerInstance> {
        validate_name(id).map_err(|reason| Error::InvalidInstanceId {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;

        Ok(ServerInstance {
            dir: self.config.instances_root.join(id),
            config: Arc::clone(&self.config),
            resolver: Arc::clone(&self.resolver),
            overlay: self.overlay.clone(),
            state: InstanceState::new(id),
            payload: None,
            launch: None,
            composition: None,
            process: None,
        })
    }
}

// =============================================================================
// Server Instance
// =============================================================================

/// How the composed root of a running instance was built.
#[derive(Debug)]
pub enum Composition {
    Mounted(MountHandle),
    Materialized {
        root: PathBuf,
        stats: MaterializeStats,
    },
}

impl Composition {
    pub fn root(&self) -> &Path {
        match self {
            Self::Mounted(handle) => handle.target(),
            Self::Materialized { root, .. } => root,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Mounted(handle) => format!("mounted:{}", handle.strategy_name()),
            Self::Materialized { .. } => "materialized".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Launch {
    strategy: ExecutionStrategy,
    command: Vec<OsString>,
    cwd: PathBuf,
}

/// One server instance and its lifecycle.
#[derive(Debug)]
pub struct ServerInstance {
    dir: PathBuf,
    config: Arc<PlannerConfig>,
    resolver: Arc<FormatResolver>,
    overlay: OverlayMount,
    state: InstanceState,
    payload: Option<PathBuf>,
    launch: Option<Launch>,
    composition: Option<Composition>,
    process: Option<ServerProcess>,
}

impl ServerInstance {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.status
    }

    /// Snapshot of the instance.
    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// Base install in use.
    pub fn payload(&self) -> Option<&Path> {
        self.payload.as_deref()
    }

    pub fn upper_dir(&self) -> PathBuf {
        self.dir.join(UPPER_DIR)
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.dir.join(MERGED_DIR)
    }

    pub fn composition(&self) -> Option<&Composition> {
        self.composition.as_ref()
    }

    pub fn strategy(&self) -> Option<&ExecutionStrategy> {
        self.launch.as_ref().map(|l| &l.strategy)
    }

    /// Command line the server is (or will be) started with.
    pub fn command(&self) -> Option<&[OsString]> {
        self.launch.as_ref().map(|l| l.command.as_slice())
    }

    fn require(&self, next: InstanceStatus) -> Result<()> {
        if self.state.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                id: self.state.id.clone(),
                state: self.state.status.to_string(),
                expected: format!("a state that may precede {}", next),
            })
        }
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        warn!(instance = %self.state.id, error = %error, "instance transition failed");
        self.state.fail(&error);
        Err(error)
    }

    // =========================================================================
    // Version Resolution
    // =========================================================================

    /// Makes the base install for `version` available.
    ///
    /// An existing `<versions_root>/<version>` is used as-is. Otherwise the
    /// payload is downloaded into a staging directory next to it and renamed
    /// into place, so an interrupted download never looks installed.
    pub async fn resolve_version(
        &mut self,
        version: &str,
        source: &dyn PayloadSource,
    ) -> Result<PathBuf> {
        self.require(InstanceStatus::VersionResolved)?;

        match self.fetch_version(version, source).await {
            Ok(payload) => {
                self.payload = Some(payload.clone());
                self.state.version = Some(version.to_string());
                self.state.transition(InstanceStatus::VersionResolved)?;
                info!(
                    instance = %self.state.id,
                    version = %version,
                    payload = %payload.display(),
                    "version resolved"
                );
                Ok(payload)
            }
            Err(e) => self.fail(e),
        }
    }

    async fn fetch_version(&self, version: &str, source: &dyn PayloadSource) -> Result<PathBuf> {
        validate_name(version).map_err(|reason| Error::VersionResolveFailed {
            version: version.to_string(),
            reason: reason.to_string(),
        })?;

        let payload = self.config.versions_root.join(version);
        if payload.is_dir() {
            debug!(version = %version, payload = %payload.display(), "version already installed");
            return Ok(payload);
        }

        let staging = self.config.versions_root.join(format!(".{}.partial", version));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        info!(version = %version, source = %source.name(), "downloading version payload");
        let timeout = self.config.download_timeout();
        let outcome = match tokio::time::timeout(timeout, source.download(version, &staging)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("download of version {}", version),
                duration: timeout,
            }),
        };

        let installed = outcome.and_then(|()| Ok(fs::rename(&staging, &payload)?));
        if let Err(e) = installed {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "failed to remove partial download");
            }
            return Err(Error::VersionResolveFailed {
                version: version.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(payload)
    }

    // =========================================================================
    // Environment Composition
    // =========================================================================

    /// Chooses the execution strategy and composes the instance root.
    ///
    /// Returns the composed root.
    pub fn compose_environment(&mut self) -> Result<PathBuf> {
        self.require(InstanceStatus::EnvironmentComposed)?;
        let Some(payload) = self.payload.clone() else {
            return Err(Error::InvalidState {
                id: self.state.id.clone(),
                state: self.state.status.to_string(),
                expected: InstanceStatus::VersionResolved.to_string(),
            });
        };

        let mut created = Vec::new();
        let composed = self
            .plan_launch(&payload)
            .and_then(|launch| {
                let composition = self.compose(&payload, &mut created)?;
                Ok((launch, composition))
            });

        match composed {
            Ok((launch, composition)) => {
                let root = composition.root().to_path_buf();
                let launch = launch.rooted_at(&root, &self.config.args);
                info!(
                    instance = %self.state.id,
                    strategy = %launch.strategy,
                    layering = %composition.label(),
                    root = %root.display(),
                    "environment composed"
                );
                self.state.strategy = Some(launch.strategy.clone());
                self.state.root = Some(root.clone());
                self.state.layering = Some(composition.label());
                self.launch = Some(launch);
                self.composition = Some(composition);
                self.state.transition(InstanceStatus::EnvironmentComposed)?;
                Ok(root)
            }
            Err(e) => {
                for dir in created.iter().rev() {
                    let _ = fs::remove_dir(dir);
                }
                self.fail(e)
            }
        }
    }

    /// Resolves the executable and picks a strategy.
    fn plan_launch(&self, payload: &Path) -> Result<PlannedLaunch> {
        let relative = sanitize_relative(&self.config.executable)?;
        let executable = payload.join(&relative);
        if !executable.is_file() {
            return Err(Error::PathNotFound(executable));
        }

        let profile = inspect(&executable)?;
        let sandbox = self.sandbox_for(&profile.arch);

        let (strategy, handler) = match (self.resolver.resolve(&executable), sandbox) {
            (Ok(handler), _) if handler.auto_dispatch() => (ExecutionStrategy::Native, Some(handler)),
            (Ok(handler), Some((rootfs, runner))) => (
                ExecutionStrategy::Sandboxed {
                    rootfs,
                    runner,
                    interpreter: handler.interpreter().map(Path::to_path_buf),
                },
                Some(handler),
            ),
            (Ok(handler), None) => match handler.interpreter().map(Path::to_path_buf) {
                Some(interpreter) => (ExecutionStrategy::Emulated { interpreter }, Some(handler)),
                None => (ExecutionStrategy::Native, Some(handler)),
            },
            (Err(Error::NoCompatibleHandler { .. }), Some((rootfs, runner))) => (
                ExecutionStrategy::Sandboxed {
                    rootfs,
                    runner,
                    interpreter: None,
                },
                None,
            ),
            (Err(e), _) => return Err(e),
        };

        debug!(
            executable = %executable.display(),
            profile = %profile,
            strategy = %strategy,
            "planned launch"
        );
        Ok(PlannedLaunch {
            strategy,
            handler,
            executable: relative,
        })
    }

    fn sandbox_for(&self, arch: &str) -> Option<(PathBuf, PathBuf)> {
        let rootfs = self.config.rootfs.get(arch).filter(|p| p.is_dir())?;
        let runner = self.config.runner_path()?;
        Some((rootfs.clone(), runner))
    }

    /// Prepares instance directories and builds the composed root.
    fn compose(&self, payload: &Path, created: &mut Vec<PathBuf>) -> Result<Composition> {
        let upper = self.upper_dir();
        let work = self.dir.join(WORK_DIR);
        let merged = self.merged_dir();
        for dir in [&self.dir, &upper, &work, &merged] {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                created.push(dir.clone());
            }
        }

        // A crash can leave a mount behind; nothing under merged is touched
        // while one is still attached.
        if is_mount_point(&merged)? {
            warn!(merged = %merged.display(), "detaching leftover mount");
            detach_unmount(&merged)?;
            if is_mount_point(&merged)? {
                return Err(Error::UnmountFailed {
                    target: merged,
                    reason: "leftover mount is still attached".to_string(),
                });
            }
        }
        if fs::read_dir(&merged)?.next().is_some() {
            return Err(Error::MaterializeFailed {
                dest: merged,
                reason: "composed root is not empty; write back or discard the previous tree first"
                    .to_string(),
            });
        }

        if self.overlay.is_available() {
            let spec = OverlaySpec::new(&merged)
                .with_lower(payload)
                .with_upper(&upper, &work);
            return self.overlay.mount(&spec).map(Composition::Mounted);
        }

        debug!(instance = %self.state.id, "no union mount available, materializing");
        let view = SoftwareOverlay::new(vec![upper, payload.to_path_buf()]);
        let stats = match view.materialize(&merged) {
            Ok(stats) => stats,
            Err(e) => {
                let _ = fs::remove_dir_all(&merged);
                let _ = fs::create_dir(&merged);
                return Err(e);
            }
        };
        Ok(Composition::Materialized {
            root: merged,
            stats,
        })
    }

    /// Releases the composed root; failures are logged.
    ///
    /// Mounted views are unmounted. A materialized root stays on disk.
    fn release_composition(&mut self) {
        let Some(composition) = self.composition.take() else {
            return;
        };

        match composition {
            Composition::Mounted(handle) => {
                if let Err(e) = self.overlay.unmount(handle) {
                    warn!(instance = %self.state.id, error = %e, "unmount failed");
                }
            }
            Composition::Materialized { root, .. } => {
                info!(
                    instance = %self.state.id,
                    root = %root.display(),
                    "materialized root left in place"
                );
            }
        }
        self.state.layering = None;
    }

    /// Fails unless no process runs and no composition is held.
    fn require_released(&self) -> Result<()> {
        if self.process.is_none() && self.composition.is_none() {
            return Ok(());
        }
        Err(Error::InvalidState {
            id: self.state.id.clone(),
            state: self.state.status.to_string(),
            expected: "a released composition".to_string(),
        })
    }

    /// Materialized root left on disk, if any.
    fn leftover_root(&self) -> Result<Option<PathBuf>> {
        let merged = self.merged_dir();
        if is_mount_point(&merged)? {
            return Err(Error::InvalidState {
                id: self.state.id.clone(),
                state: "mounted".to_string(),
                expected: "a materialized root".to_string(),
            });
        }
        if !merged.is_dir() || fs::read_dir(&merged)?.next().is_none() {
            return Ok(None);
        }
        Ok(Some(merged))
    }

    /// Copies every file of a materialized root left by a stopped run that
    /// differs from the payload into the writable layer.
    ///
    /// Deletions are not carried over. Returns the number of entries
    /// written; zero when there is no materialized root.
    pub fn write_back(&self) -> Result<u64> {
        self.require_released()?;
        let Some(payload) = self.payload.as_deref() else {
            return Err(Error::InvalidState {
                id: self.state.id.clone(),
                state: self.state.status.to_string(),
                expected: InstanceStatus::VersionResolved.to_string(),
            });
        };
        match self.leftover_root()? {
            Some(root) => storage::write_back(&root, payload, &self.upper_dir()),
            None => Ok(0),
        }
    }

    /// Removes a materialized root left by a stopped run.
    pub fn discard_materialized(&mut self) -> Result<()> {
        self.require_released()?;
        if let Some(root) = self.leftover_root()? {
            fs::remove_dir_all(&root)?;
            fs::create_dir(&root)?;
            info!(instance = %self.state.id, root = %root.display(), "discarded materialized root");
        }
        Ok(())
    }

    // =========================================================================
    // Process Lifecycle
    // =========================================================================

    /// Starts the server in the composed root.
    pub async fn start(&mut self) -> Result<u32> {
        self.require(InstanceStatus::Running)?;
        let Some(launch) = self.launch.clone() else {
            return self.fail(Error::Internal("composed instance has no launch plan".to_string()));
        };

        let spawned = ServerProcess::spawn(&self.state.id, &launch.command, &launch.cwd)
            .and_then(|process| {
                let pid = process.pid().ok_or_else(|| Error::StartFailed {
                    id: self.state.id.clone(),
                    reason: "process exited immediately".to_string(),
                })?;
                Ok((process, pid))
            });

        match spawned {
            Ok((process, pid)) => {
                self.process = Some(process);
                self.state.pid = Some(pid);
                self.state.exit_code = None;
                self.state.transition(InstanceStatus::Running)?;
                Ok(pid)
            }
            Err(e) => {
                self.release_composition();
                self.fail(e)
            }
        }
    }

    /// Writes a line to the server console.
    pub async fn send_command(&mut self, line: &str) -> Result<()> {
        match self.process.as_mut() {
            Some(process) => process.send_line(line).await,
            None => Err(Error::InvalidState {
                id: self.state.id.clone(),
                state: self.state.status.to_string(),
                expected: InstanceStatus::Running.to_string(),
            }),
        }
    }

    /// Stops the server, then releases the composed root regardless of how
    /// the process ended. The writable layer is kept, as is a materialized
    /// root.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome> {
        self.require(InstanceStatus::Stopped)?;
        let Some(mut process) = self.process.take() else {
            return self.fail(Error::Internal("running instance has no process".to_string()));
        };

        let stopped = process.stop(&self.config.stop_command, grace).await;
        self.release_composition();
        self.state.pid = None;

        match stopped {
            Ok(outcome) => {
                self.state.exit_code = outcome.exit_code;
                self.state.transition(InstanceStatus::Stopped)?;
                info!(
                    instance = %self.state.id,
                    exit_code = ?outcome.exit_code,
                    forced = outcome.forced,
                    "instance stopped"
                );
                Ok(outcome)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Waits for the server to exit on its own, then releases the root.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        self.require(InstanceStatus::Stopped)?;
        let Some(mut process) = self.process.take() else {
            return self.fail(Error::Internal("running instance has no process".to_string()));
        };

        let exited = process.wait().await;
        self.release_composition();
        self.state.pid = None;

        match exited {
            Ok(code) => {
                self.state.exit_code = code;
                self.state.transition(InstanceStatus::Stopped)?;
                Ok(code)
            }
            Err(e) => self.fail(e),
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(Composition::Mounted(handle)) = self.composition.take()
            && let Err(e) = self.overlay.unmount(handle)
        {
            warn!(instance = %self.state.id, error = %e, "unmount on drop failed");
        }
    }
}

/// Strategy chosen before the root exists.
#[derive(Debug)]
struct PlannedLaunch {
    strategy: ExecutionStrategy,
    handler: Option<FormatHandler>,
    executable: PathBuf,
}

impl PlannedLaunch {
    /// Builds the final command once the composed root is known.
    fn rooted_at(self, root: &Path, args: &[String]) -> Launch {
        let args: Vec<OsString> = args.iter().map(OsString::from).collect();

        let command = match &self.strategy {
            ExecutionStrategy::Native => {
                let mut argv = vec![root.join(&self.executable).into_os_string()];
                argv.extend(args);
                argv
            }
            ExecutionStrategy::Emulated { .. } => {
                let program = root.join(&self.executable);
                match &self.handler {
                    Some(handler) => handler.command_for(&program, &args),
                    None => std::iter::once(program.into_os_string()).chain(args).collect(),
                }
            }
            ExecutionStrategy::Sandboxed {
                rootfs,
                runner,
                interpreter,
            } => {
                let inner = Path::new("/").join(SANDBOX_PAYLOAD_DIR);
                let mut bind = root.as_os_str().to_os_string();
                bind.push(":");
                bind.push(&inner);

                let mut argv: Vec<OsString> = vec![
                    runner.clone().into_os_string(),
                    "-r".into(),
                    rootfs.clone().into_os_string(),
                    "-b".into(),
                    bind,
                    "-w".into(),
                    inner.clone().into_os_string(),
                ];
                if let Some(interpreter) = interpreter {
                    argv.push("-q".into());
                    argv.push(interpreter.clone().into_os_string());
                }
                argv.push(inner.join(&self.executable).into_os_string());
                argv.extend(args);
                argv
            }
        };

        Launch {
            strategy: self.strategy,
            command,
            cwd: root.to_path_buf(),
        }
    }
}
