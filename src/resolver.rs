//! # Format Resolution
//!
//! Decides how a given executable can be run on this host: directly,
//! transparently through a kernel-registered handler, or explicitly wrapped
//! with an interpreter command.
//!
//! Handlers are tried in the registry's precedence order against the file's
//! header bytes; the first masked-magic match wins.
//!
//! ```rust,ignore
//! use polyrun::FormatResolver;
//!
//! let resolver = FormatResolver::discover(Default::default())?;
//! let handler = resolver.resolve("versions/1.2/server".as_ref())?;
//! if resolver.requires_emulation("versions/1.2/server".as_ref())? {
//!     println!("wrap with {:?}", handler.interpreter());
//! }
//! ```

use crate::error::{Error, Result};
use crate::handler::FormatHandler;
use crate::inspect::{ContainerFormat, ExecutableProfile, inspect_reader};
use crate::platform::normalize_arch;
use crate::registry::{EmulatorRegistry, RegistryConfig};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::debug;

/// Resolves executables against a fixed, ordered handler list.
#[derive(Debug, Clone)]
pub struct FormatResolver {
    handlers: Vec<FormatHandler>,
}

impl FormatResolver {
    /// Creates a resolver over handlers already in precedence order.
    pub fn new(handlers: Vec<FormatHandler>) -> Self {
        Self { handlers }
    }

    /// Creates a resolver from a registry scan.
    pub fn discover(config: RegistryConfig) -> Result<Self> {
        EmulatorRegistry::with_config(config)
            .discover()
            .map(Self::new)
    }

    /// Handlers in precedence order.
    pub fn handlers(&self) -> &[FormatHandler] {
        &self.handlers
    }

    /// Returns true if some handler executes the given architecture.
    ///
    /// Accepts a bare tag (`aarch64`) or an `os/arch` pair
    /// (`linux/arm64`); only the architecture component is compared.
    pub fn matches_host(&self, arch_or_pair: &str) -> Result<bool> {
        let arch = arch_or_pair
            .rsplit_once('/')
            .map(|(_, arch)| arch)
            .unwrap_or(arch_or_pair);
        if arch.trim().is_empty() {
            return Err(Error::InvalidPlatform(arch_or_pair.to_string()));
        }

        let arch = normalize_arch(arch);
        Ok(self.handlers.iter().any(|h| h.arch == arch))
    }

    /// Resolves the handler for the file at `path`.
    pub fn resolve(&self, path: &Path) -> Result<FormatHandler> {
        let mut file = File::open(path)?;
        self.resolve_reader(&mut file, &path.display().to_string())
    }

    /// Resolves the handler for an executable read from `reader`.
    pub fn resolve_reader<R: Read + Seek>(
        &self,
        reader: &mut R,
        label: &str,
    ) -> Result<FormatHandler> {
        let profile = inspect_reader(reader, label)?;

        for handler in &self.handlers {
            if !handler.probe(reader)? {
                continue;
            }
            // PE magic only pins the DOS stub; the machine comes from the header.
            if profile.format == ContainerFormat::Pe && handler.arch != profile.arch {
                continue;
            }
            debug!(file = %label, profile = %profile, handler = %handler, "resolved handler");
            return Ok(handler.clone());
        }

        Err(no_handler(label, &profile))
    }

    /// Returns true if the file must be launched through its handler's
    /// interpreter rather than executed directly.
    pub fn requires_emulation(&self, path: &Path) -> Result<bool> {
        Ok(!self.resolve(path)?.auto_dispatch())
    }

    /// Reader variant of [`FormatResolver::requires_emulation`].
    pub fn requires_emulation_reader<R: Read + Seek>(
        &self,
        reader: &mut R,
        label: &str,
    ) -> Result<bool> {
        Ok(!self.resolve_reader(reader, label)?.auto_dispatch())
    }
}

fn no_handler(label: &str, profile: &ExecutableProfile) -> Error {
    Error::NoCompatibleHandler {
        path: label.to_string(),
        os: profile.os.to_string(),
        arch: profile.arch.clone(),
    }
}
