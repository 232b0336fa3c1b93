//! # polyrun
//!
//! **Foreign-Architecture Server Runner over Layered Storage**
//!
//! Runs a prebuilt, platform-specific server executable on a host whose OS
//! or CPU architecture may not match the binary, while keeping the installed
//! payload immutable and all per-instance state in a separate writable
//! layer.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      ExecutionPlanner                               │
//! │   resolve_version → compose_environment → start → stop              │
//! ├──────────────────────────────────┬──────────────────────────────────┤
//! │     Binary-Format Resolution     │        Layered Storage           │
//! │  ┌────────────────────────────┐  │  ┌────────────────────────────┐  │
//! │  │ FormatResolver             │  │  │ OverlayMount               │  │
//! │  │  first masked-magic match  │  │  │  kernel → fuse-overlayfs   │  │
//! │  └─────────────┬──────────────┘  │  └─────────────┬──────────────┘  │
//! │  ┌─────────────┴──────────────┐  │  ┌─────────────┴──────────────┐  │
//! │  │ EmulatorRegistry           │  │  │ CapabilityState (probed)   │  │
//! │  │  translator > kernel >     │  │  └────────────────────────────┘  │
//! │  │  emulator > host > native  │  │  ┌────────────────────────────┐  │
//! │  └─────────────┬──────────────┘  │  │ SoftwareOverlay (fallback) │  │
//! │  ┌─────────────┴──────────────┐  │  │  first-wins, materialize   │  │
//! │  │ inspect: ELF / PE / Mach-O │  │  └────────────────────────────┘  │
//! │  └────────────────────────────┘  │                                  │
//! └──────────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! # Execution Strategies
//!
//! | Strategy    | Launch                                     |
//! |-------------|--------------------------------------------|
//! | `Native`    | executable directly (kernel may dispatch)  |
//! | `Emulated`  | `<emulator> <executable> <args>`           |
//! | `Sandboxed` | `proot -r <rootfs> [-q <emulator>] ...`    |
//!
//! # Layering
//!
//! The instance root is `[upper, payload]` with `upper` winning. With a
//! working union mount it is a live view; otherwise it is materialized by
//! copying and left on disk after the server stops, where
//! `ServerInstance::write_back` folds changes into `upper` on request. The
//! payload is never written either way.
//!
//! # Non-Goals
//!
//! This is not a container runtime: no namespaces, cgroups, or network
//! virtualization. It does not emulate instructions; emulators and
//! translators must already be installed.
//!
//! # Example
//!
//! ```rust,ignore
//! use polyrun::{CapabilityState, ExecutionPlanner, FormatResolver, PlannerConfig};
//! use polyrun::runtime::LocalPayloadSource;
//!
//! #[tokio::main]
//! async fn main() -> polyrun::Result<()> {
//!     let resolver = FormatResolver::discover(Default::default())?;
//!     let planner = ExecutionPlanner::new(
//!         PlannerConfig::default(),
//!         resolver,
//!         CapabilityState::probe(),
//!     );
//!
//!     let mut instance = planner.instance("survival")?;
//!     instance
//!         .resolve_version("1.21.0", &LocalPayloadSource::new("/srv/releases"))
//!         .await?;
//!     instance.compose_environment()?;
//!     instance.start().await?;
//!     instance.stop(polyrun::DEFAULT_GRACE_PERIOD).await?;
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod constants;
pub mod error;
pub mod handler;
pub mod inspect;
pub mod overlay;
pub mod planner;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod storage;
pub mod supervisor;

// Re-exports
pub use capability::CapabilityState;
pub use constants::*;
pub use error::{Error, Result};
pub use handler::{DispatchFlag, FormatHandler, HandlerSource};
pub use inspect::{ContainerFormat, ExecutableProfile, inspect};
pub use overlay::{LayerStrategy, MountHandle, OverlayMount, OverlaySpec};
pub use planner::{Composition, ExecutionPlanner, PlannerConfig, ServerInstance};
pub use platform::{OsFamily, Platform};
pub use registry::{EmulatorRegistry, RegistryConfig};
pub use resolver::FormatResolver;
pub use runtime::{ExecutionStrategy, InstanceState, InstanceStatus, PayloadSource};
pub use storage::{LayeredView, MountedView, SoftwareOverlay};
