//! Tests for execution planning.
//!
//! Drives server instances through their lifecycle against temp-dir
//! installs. The payload executable is a copy of the host shell, so the
//! native path really runs; foreign strategies are checked by the command
//! they would launch.

#![cfg(target_os = "linux")]

use async_trait::async_trait;
use polyrun::handler::{FormatHandler, HandlerSource};
use polyrun::overlay::{
    KernelOverlay, LayerStrategy, OverlayMount, OverlaySpec, StrategyKind, is_mount_point,
};
use polyrun::platform::OsFamily;
use polyrun::registry::{RegistryConfig, builtin_signature};
use polyrun::runtime::{ExecutionStrategy, InstanceStatus, PayloadSource};
use polyrun::storage::SoftwareOverlay;
use polyrun::{CapabilityState, Error, ExecutionPlanner, FormatResolver, PlannerConfig, Result};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SERVER_SCRIPT: &str =
    "echo started; echo changed > server.properties; echo new > world.dat; read line; exit 0";

fn make_executable(path: &Path) {
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Installs a release whose `server` is the host shell.
fn install_native(root: &Path, version: &str) -> PathBuf {
    let payload = root.join("versions").join(version);
    fs::create_dir_all(&payload).unwrap();
    fs::copy("/bin/sh", payload.join("server")).unwrap();
    make_executable(&payload.join("server"));
    fs::write(payload.join("server.properties"), b"motd=default\n").unwrap();
    payload
}

/// Installs a release whose `server` is a 64-bit ARM executable header.
fn install_aarch64(root: &Path, version: &str) -> PathBuf {
    let payload = root.join("versions").join(version);
    fs::create_dir_all(&payload).unwrap();

    let mut header = vec![0u8; 64];
    header[..4].copy_from_slice(b"\x7fELF");
    header[4] = 2;
    header[5] = 1;
    header[6] = 1;
    header[16..18].copy_from_slice(&2u16.to_le_bytes());
    header[18..20].copy_from_slice(&183u16.to_le_bytes());
    fs::write(payload.join("server"), header).unwrap();
    make_executable(&payload.join("server"));
    payload
}

fn host_resolver(root: &Path) -> FormatResolver {
    let binfmt = root.join("binfmt_misc");
    fs::create_dir_all(&binfmt).unwrap();
    FormatResolver::discover(
        RegistryConfig::default()
            .with_binfmt_dir(binfmt)
            .with_search_path(Vec::new()),
    )
    .unwrap()
}

fn translator_resolver(translator: &Path) -> FormatResolver {
    let (magic, mask) = builtin_signature("aarch64").unwrap();
    let source = HandlerSource::TranslatorOverride {
        translator: translator.to_path_buf(),
    };
    let handler = FormatHandler::new("aarch64", OsFamily::Linux, source, magic, mask).unwrap();
    FormatResolver::new(vec![handler])
}

fn config(root: &Path) -> PlannerConfig {
    PlannerConfig::default()
        .with_root(root)
        .with_search_path(Vec::new())
        .with_args(vec!["-c".to_string(), SERVER_SCRIPT.to_string()])
}

fn server_argv(program: impl Into<OsString>) -> Vec<OsString> {
    vec![program.into(), "-c".into(), SERVER_SCRIPT.into()]
}

/// Counts downloads and copies a fixed tree into the target.
#[derive(Default)]
struct CountingSource {
    release: Option<PathBuf>,
    calls: AtomicUsize,
}

impl CountingSource {
    fn from_release(release: PathBuf) -> Self {
        Self {
            release: Some(release),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn download(&self, version: &str, target_dir: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(target_dir.join("partial.bin"), b"half")?;
        match &self.release {
            Some(release) => {
                fs::remove_file(target_dir.join("partial.bin"))?;
                SoftwareOverlay::new(vec![release.clone()]).materialize(target_dir)?;
                Ok(())
            }
            None => Err(Error::VersionResolveFailed {
                version: version.to_string(),
                reason: "mirror unreachable".to_string(),
            }),
        }
    }
}

struct SlowSource;

#[async_trait]
impl PayloadSource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    async fn download(&self, _version: &str, _target_dir: &Path) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Presents the lower layers by copying them into the target.
#[derive(Debug, Default)]
struct CopyStrategy {
    unmounted: Mutex<Vec<PathBuf>>,
}

impl LayerStrategy for CopyStrategy {
    fn name(&self) -> &str {
        "copy"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::UserSpace
    }

    fn mount(&self, spec: &OverlaySpec) -> Result<()> {
        SoftwareOverlay::new(spec.lower.clone()).materialize(&spec.target)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.unmounted.lock().unwrap().push(target.to_path_buf());
        fs::remove_dir_all(target)?;
        fs::create_dir(target)?;
        Ok(())
    }
}

#[derive(Debug)]
struct RefusingStrategy;

impl LayerStrategy for RefusingStrategy {
    fn name(&self) -> &str {
        "refusing"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Kernel
    }

    fn mount(&self, spec: &OverlaySpec) -> Result<()> {
        Err(Error::MountFailed {
            target: spec.target.clone(),
            reason: "operation not permitted".to_string(),
        })
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Instance Creation And Ordering
// =============================================================================

#[test]
fn test_invalid_instance_ids() {
    let dir = TempDir::new().unwrap();
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        FormatResolver::new(Vec::new()),
        CapabilityState::none(),
    );

    for id in ["", "..", "a/b", "white space"] {
        assert!(
            matches!(planner.instance(id), Err(Error::InvalidInstanceId { .. })),
            "{:?} should be rejected",
            id
        );
    }
    assert_eq!(planner.instance("survival-1").unwrap().id(), "survival-1");
}

#[tokio::test]
async fn test_out_of_order_transitions() {
    let dir = TempDir::new().unwrap();
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        FormatResolver::new(Vec::new()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();

    assert!(matches!(
        instance.compose_environment().unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert!(matches!(
        instance.start().await.unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert!(matches!(
        instance.stop(Duration::from_secs(1)).await.unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert!(matches!(
        instance.send_command("say hi").await.unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert_eq!(instance.status(), InstanceStatus::Uninitialized);
}

// =============================================================================
// Version Resolution
// =============================================================================

#[tokio::test]
async fn test_installed_version_skips_download() {
    let dir = TempDir::new().unwrap();
    let payload = install_native(dir.path(), "1.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();
    let source = CountingSource::default();

    assert_eq!(instance.resolve_version("1.0.0", &source).await.unwrap(), payload);
    assert_eq!(source.calls(), 0);
    assert_eq!(instance.status(), InstanceStatus::VersionResolved);
    assert_eq!(instance.payload(), Some(payload.as_path()));
    assert_eq!(instance.state().version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_download_installs_once() {
    let dir = TempDir::new().unwrap();
    let release = install_native(&dir.path().join("mirror"), "2.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let source = CountingSource::from_release(release);

    let mut first = planner.instance("first").unwrap();
    let payload = first.resolve_version("2.0.0", &source).await.unwrap();
    assert_eq!(payload, dir.path().join("versions/2.0.0"));
    assert!(payload.join("server").is_file());
    assert!(!dir.path().join("versions/.2.0.0.partial").exists());

    let mut second = planner.instance("second").unwrap();
    second.resolve_version("2.0.0", &source).await.unwrap();
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_failed_download_removes_partial() {
    let dir = TempDir::new().unwrap();
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();

    let err = instance
        .resolve_version("3.0.0", &CountingSource::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VersionResolveFailed { .. }));
    assert!(!dir.path().join("versions/3.0.0").exists());
    assert!(!dir.path().join("versions/.3.0.0.partial").exists());
    assert_eq!(instance.status(), InstanceStatus::Failed);
    assert!(
        instance
            .state()
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("mirror unreachable"))
    );
}

#[tokio::test]
async fn test_download_timeout() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.download_timeout_secs = 0;
    let planner = ExecutionPlanner::new(cfg, host_resolver(dir.path()), CapabilityState::none());
    let mut instance = planner.instance("survival").unwrap();

    match instance.resolve_version("4.0.0", &SlowSource).await.unwrap_err() {
        Error::VersionResolveFailed { version, reason } => {
            assert_eq!(version, "4.0.0");
            assert!(reason.contains("timed out"), "{}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dir.path().join("versions/.4.0.0.partial").exists());
}

#[tokio::test]
async fn test_invalid_version_name() {
    let dir = TempDir::new().unwrap();
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();
    let source = CountingSource::default();

    let err = instance.resolve_version("../etc", &source).await.unwrap_err();
    assert!(matches!(err, Error::VersionResolveFailed { .. }));
    assert_eq!(source.calls(), 0);
}

// =============================================================================
// Native Lifecycle Over Materialized Storage
// =============================================================================

#[tokio::test]
async fn test_native_lifecycle_keeps_payload_immutable() {
    let dir = TempDir::new().unwrap();
    let payload = install_native(dir.path(), "1.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();

    let root = instance.compose_environment().unwrap();
    assert_eq!(root, instance.merged_dir());
    assert_eq!(instance.strategy(), Some(&ExecutionStrategy::Native));
    assert_eq!(instance.composition().unwrap().label(), "materialized");
    assert_eq!(instance.state().layering.as_deref(), Some("materialized"));
    assert_eq!(
        instance.command().unwrap(),
        server_argv(root.join("server")).as_slice()
    );
    assert!(root.join("server").is_file());

    let pid = instance.start().await.unwrap();
    assert!(pid > 0);
    assert_eq!(instance.status(), InstanceStatus::Running);
    assert_eq!(instance.state().pid, Some(pid));
    assert!(matches!(
        instance.write_back().unwrap_err(),
        Error::InvalidState { .. }
    ));

    let outcome = instance.stop(Duration::from_secs(10)).await.unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert!(!outcome.forced);
    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert_eq!(instance.state().pid, None);

    // The materialized root stays on disk; nothing reached upper yet.
    let upper = instance.upper_dir();
    assert_eq!(fs::read_to_string(root.join("server.properties")).unwrap(), "changed\n");
    assert_eq!(fs::read_to_string(root.join("world.dat")).unwrap(), "new\n");
    assert_eq!(fs::read_dir(&upper).unwrap().count(), 0);

    assert_eq!(instance.write_back().unwrap(), 2);
    assert_eq!(fs::read_to_string(upper.join("server.properties")).unwrap(), "changed\n");
    assert_eq!(fs::read_to_string(upper.join("world.dat")).unwrap(), "new\n");
    assert!(!upper.join("server").exists());

    assert_eq!(
        fs::read_to_string(payload.join("server.properties")).unwrap(),
        "motd=default\n"
    );
    assert!(!payload.join("world.dat").exists());

    instance.discard_materialized().unwrap();
    assert_eq!(fs::read_dir(instance.merged_dir()).unwrap().count(), 0);
    assert_eq!(instance.write_back().unwrap(), 0);

    // Upper wins on the next composition.
    let root = instance.compose_environment().unwrap();
    assert_eq!(fs::read_to_string(root.join("server.properties")).unwrap(), "changed\n");
    assert!(root.join("world.dat").is_file());
}

#[tokio::test]
async fn test_wait_for_exit() {
    let dir = TempDir::new().unwrap();
    install_native(dir.path(), "1.0.0");
    let cfg = config(dir.path()).with_args(vec!["-c".to_string(), "exit 7".to_string()]);
    let planner = ExecutionPlanner::new(cfg, host_resolver(dir.path()), CapabilityState::none());
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();
    instance.compose_environment().unwrap();
    instance.start().await.unwrap();

    assert_eq!(instance.wait().await.unwrap(), Some(7));
    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert_eq!(instance.state().exit_code, Some(7));
}

#[tokio::test]
async fn test_leftover_root_is_left_for_the_caller() {
    let dir = TempDir::new().unwrap();
    install_native(dir.path(), "1.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();

    let merged = instance.merged_dir();
    let upper = instance.upper_dir();
    fs::create_dir_all(&merged).unwrap();
    fs::create_dir_all(&upper).unwrap();
    fs::write(merged.join("crash-report.txt"), b"boom").unwrap();
    fs::write(upper.join("world.dat"), b"instance-state").unwrap();

    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();
    assert!(matches!(
        instance.compose_environment().unwrap_err(),
        Error::MaterializeFailed { .. }
    ));
    assert_eq!(instance.status(), InstanceStatus::Failed);
    assert!(merged.join("crash-report.txt").is_file());
    assert!(!upper.join("crash-report.txt").exists());
    assert_eq!(fs::read(upper.join("world.dat")).unwrap(), b"instance-state");

    instance.discard_materialized().unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();
    let root = instance.compose_environment().unwrap();
    assert!(!root.join("crash-report.txt").exists());
    assert_eq!(fs::read(root.join("world.dat")).unwrap(), b"instance-state");
    assert!(root.join("server").is_file());
}

#[tokio::test]
async fn test_write_back_needs_a_version() {
    let dir = TempDir::new().unwrap();
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let instance = planner.instance("survival").unwrap();
    assert!(matches!(
        instance.write_back().unwrap_err(),
        Error::InvalidState { .. }
    ));
}

#[tokio::test]
#[ignore = "requires root and overlayfs"]
async fn test_leftover_kernel_mount_is_detached_before_composing() {
    let dir = TempDir::new().unwrap();
    let payload = install_native(dir.path(), "1.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();

    let upper = instance.upper_dir();
    let work = dir.path().join("instances/survival/work");
    let merged = instance.merged_dir();
    for d in [&upper, &work, &merged] {
        fs::create_dir_all(d).unwrap();
    }
    fs::write(upper.join("world.dat"), b"instance-state").unwrap();

    let kernel: Arc<dyn LayerStrategy> = Arc::new(KernelOverlay::default());
    let spec = OverlaySpec::new(&merged)
        .with_lower(&payload)
        .with_upper(&upper, &work);
    OverlayMount::with_strategies(vec![kernel]).mount(&spec).unwrap();
    assert!(is_mount_point(&merged).unwrap());

    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();
    let root = instance.compose_environment().unwrap();

    assert!(!is_mount_point(&merged).unwrap());
    assert_eq!(fs::read(upper.join("world.dat")).unwrap(), b"instance-state");
    assert_eq!(fs::read(root.join("world.dat")).unwrap(), b"instance-state");
    assert!(!upper.join("server").exists());
}

#[tokio::test]
async fn test_missing_executable() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("versions/1.0.0")).unwrap();
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();

    assert!(matches!(
        instance.compose_environment().unwrap_err(),
        Error::PathNotFound(_)
    ));
    assert_eq!(instance.status(), InstanceStatus::Failed);
    assert!(!dir.path().join("instances/survival").exists());
}

// =============================================================================
// Foreign Strategies
// =============================================================================

#[tokio::test]
async fn test_emulated_command() {
    let dir = TempDir::new().unwrap();
    install_aarch64(dir.path(), "1.0.0");
    let translator = dir.path().join("box-aarch64");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        translator_resolver(&translator),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();

    let root = instance.compose_environment().unwrap();
    assert_eq!(
        instance.strategy(),
        Some(&ExecutionStrategy::Emulated {
            interpreter: translator.clone()
        })
    );
    let mut expected = vec![translator.clone().into_os_string()];
    expected.extend(server_argv(root.join("server")));
    assert_eq!(instance.command().unwrap(), expected.as_slice());
}

fn sandbox_config(root: &Path) -> (PlannerConfig, PathBuf, PathBuf) {
    let rootfs = root.join("rootfs/aarch64");
    let bin = root.join("bin");
    fs::create_dir_all(&rootfs).unwrap();
    fs::create_dir_all(&bin).unwrap();
    let runner = bin.join("proot");
    fs::write(&runner, b"#!/bin/sh\n").unwrap();
    make_executable(&runner);

    let cfg = config(root)
        .with_rootfs("aarch64", &rootfs)
        .with_search_path(vec![bin]);
    (cfg, rootfs, runner)
}

#[tokio::test]
async fn test_sandboxed_without_handler() {
    let dir = TempDir::new().unwrap();
    install_aarch64(dir.path(), "1.0.0");
    let (cfg, rootfs, runner) = sandbox_config(dir.path());
    let planner = ExecutionPlanner::new(cfg, FormatResolver::new(Vec::new()), CapabilityState::none());
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();

    let root = instance.compose_environment().unwrap();
    assert_eq!(
        instance.strategy(),
        Some(&ExecutionStrategy::Sandboxed {
            rootfs: rootfs.clone(),
            runner: runner.clone(),
            interpreter: None,
        })
    );

    let mut bind = root.clone().into_os_string();
    bind.push(":/opt/server");
    let mut expected: Vec<OsString> = vec![
        runner.into_os_string(),
        "-r".into(),
        rootfs.into_os_string(),
        "-b".into(),
        bind,
        "-w".into(),
        "/opt/server".into(),
    ];
    expected.extend(server_argv("/opt/server/server"));
    assert_eq!(instance.command().unwrap(), expected.as_slice());
}

#[tokio::test]
async fn test_sandboxed_with_emulator() {
    let dir = TempDir::new().unwrap();
    install_aarch64(dir.path(), "1.0.0");
    let (cfg, rootfs, runner) = sandbox_config(dir.path());
    let translator = dir.path().join("qemu-aarch64");
    let planner = ExecutionPlanner::new(cfg, translator_resolver(&translator), CapabilityState::none());
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();
    instance.compose_environment().unwrap();

    assert_eq!(
        instance.strategy(),
        Some(&ExecutionStrategy::Sandboxed {
            rootfs,
            runner,
            interpreter: Some(translator.clone()),
        })
    );
    let command = instance.command().unwrap();
    let q = command.iter().position(|a| a == "-q").unwrap();
    assert_eq!(command[q + 1], translator.into_os_string());
}

#[tokio::test]
async fn test_no_handler_and_no_rootfs() {
    let dir = TempDir::new().unwrap();
    install_aarch64(dir.path(), "1.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        FormatResolver::new(Vec::new()),
        CapabilityState::none(),
    );
    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();

    match instance.compose_environment().unwrap_err() {
        Error::NoCompatibleHandler { arch, .. } => assert_eq!(arch, "aarch64"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(instance.status(), InstanceStatus::Failed);
}

// =============================================================================
// Mounted Composition
// =============================================================================

#[tokio::test]
async fn test_mounted_composition_unmounted_on_drop() {
    let dir = TempDir::new().unwrap();
    install_native(dir.path(), "1.0.0");
    let strategy = Arc::new(CopyStrategy::default());
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    )
    .with_overlay(OverlayMount::with_strategies(vec![
        strategy.clone() as Arc<dyn LayerStrategy>
    ]));

    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();
    let root = instance.compose_environment().unwrap();

    assert_eq!(instance.composition().unwrap().label(), "mounted:copy");
    assert!(root.join("server").is_file());
    assert!(matches!(
        instance.discard_materialized().unwrap_err(),
        Error::InvalidState { .. }
    ));

    drop(instance);
    assert_eq!(*strategy.unmounted.lock().unwrap(), vec![root]);
}

#[tokio::test]
async fn test_failed_mount_removes_created_dirs() {
    let dir = TempDir::new().unwrap();
    install_native(dir.path(), "1.0.0");
    let planner = ExecutionPlanner::new(
        config(dir.path()),
        host_resolver(dir.path()),
        CapabilityState::none(),
    )
    .with_overlay(OverlayMount::with_strategies(vec![
        Arc::new(RefusingStrategy) as Arc<dyn LayerStrategy>
    ]));

    let mut instance = planner.instance("survival").unwrap();
    instance
        .resolve_version("1.0.0", &CountingSource::default())
        .await
        .unwrap();

    assert!(matches!(
        instance.compose_environment().unwrap_err(),
        Error::MountFailed { .. }
    ));
    assert_eq!(instance.status(), InstanceStatus::Failed);
    assert!(!dir.path().join("instances/survival").exists());
}
