//! # Emulator Registry
//!
//! Enumerates the binary-format handlers usable on this host.
//!
//! ## Sources
//!
//! | Source              | Where from                                | Auto-dispatch |
//! |---------------------|-------------------------------------------|---------------|
//! | Translator override | `box64` / `box86` on the search path      | no            |
//! | Kernel registered   | `qemu-*` entries in the binfmt directory  | if `enabled`  |
//! | Static fallback     | built-in magic table + `qemu-<arch>[-static]` on the path | no |
//! | Native              | the host's own architecture               | yes           |
//!
//! ## Precedence
//!
//! The most specific source wins. [`EmulatorRegistry::discover`] returns
//! handlers ordered translator, kernel, static fallback, native; within a
//! source, by architecture tag. A static-fallback entry is only added for an
//! architecture no kernel registration covers, and architectures the host
//! runs natively never get an emulator entry.
//!
//! Hosts whose kernel has no format registration get a fixed table of the
//! guests the OS runs transparently instead (Rosetta on macOS, WOW64 and
//! x64 emulation on Windows).
//!
//! ## Failure Policy
//!
//! A descriptor that cannot be read or parsed is skipped with a warning;
//! one bad registration never fails the whole scan.

use crate::constants::{
    BINFMT_MISC_DIR, EMULATOR_PREFIX, I386_TRANSLATOR, MAX_DESCRIPTOR_SIZE,
    STATIC_EMULATOR_SUFFIX, X86_64_TRANSLATOR,
};
use crate::error::{Error, Result};
use crate::handler::{DispatchFlag, FormatHandler, HandlerSource, decode_hex};
use crate::platform::{OsFamily, Platform, normalize_arch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Rosetta runtime location on macOS.
pub const ROSETTA_RUNTIME_PATH: &str = "/Library/Apple/usr/libexec/oah/libRosettaRuntime";

/// Built-in ELF signatures: (arch, magic, mask).
///
/// 20-byte prefixes: `\x7fELF`, class, data, version fixed; OSABI masked;
/// `e_type` low bit masked (EXEC or DYN); `e_machine` fixed.
const ELF_SIGNATURES: &[(&str, &str, &str)] = &[
    (
        "i386",
        "7f454c4601010100000000000000000002000300",
        "fffffffffffefe00fffffffffffffffffeffffff",
    ),
    (
        "x86_64",
        "7f454c4602010100000000000000000002003e00",
        "fffffffffffefe00fffffffffffffffffeffffff",
    ),
    (
        "arm",
        "7f454c4601010100000000000000000002002800",
        "ffffffffffffff00fffffffffffffffffeffffff",
    ),
    (
        "aarch64",
        "7f454c460201010000000000000000000200b700",
        "ffffffffffffff00fffffffffffffffffeffffff",
    ),
    (
        "ppc",
        "7f454c4601020100000000000000000000020014",
        "ffffffffffffff00fffffffffffffffffffeffff",
    ),
    (
        "ppc64",
        "7f454c4602020100000000000000000000020015",
        "ffffffffffffff00fffffffffffffffffffeffff",
    ),
    (
        "riscv32",
        "7f454c460101010000000000000000000200f300",
        "ffffffffffffff00fffffffffffffffffeffffff",
    ),
    (
        "riscv64",
        "7f454c460201010000000000000000000200f300",
        "ffffffffffffff00fffffffffffffffffeffffff",
    ),
];

/// Mach-O 64-bit headers (little-endian magic + cputype).
const MACHO_X86_64_MAGIC: &[u8] = &[0xcf, 0xfa, 0xed, 0xfe, 0x07, 0x00, 0x00, 0x01];
const MACHO_ARM64_MAGIC: &[u8] = &[0xcf, 0xfa, 0xed, 0xfe, 0x0c, 0x00, 0x00, 0x01];

/// PE files carry the machine field at a variable offset; only the DOS stub
/// is matched and the resolver checks the architecture from the header.
const PE_MAGIC: &[u8] = b"MZ";

/// Returns the built-in ELF signature for an architecture.
pub fn builtin_signature(arch: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    ELF_SIGNATURES
        .iter()
        .find(|(a, _, _)| *a == arch)
        .and_then(|(_, magic, mask)| Some((decode_hex(magic).ok()?, decode_hex(mask).ok()?)))
}

/// Architectures with a built-in signature.
pub fn builtin_architectures() -> impl Iterator<Item = &'static str> {
    ELF_SIGNATURES.iter().map(|(arch, _, _)| *arch)
}

/// Architectures a host executes without any emulation.
pub fn native_architectures(host: &Platform) -> Vec<String> {
    match host.arch.as_str() {
        "x86_64" => vec!["x86_64".to_string(), "i386".to_string()],
        other => vec![other.to_string()],
    }
}

/// Finds an executable file named `name` in `search_path`.
pub fn which(name: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    search_path
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Parses one kernel format-registration descriptor.
///
/// The format is line-oriented: a bare `enabled`/`disabled` status line,
/// then `key value` lines (`interpreter`, `flags:`, `offset`, `magic`,
/// `mask`). Magic and mask are hex. Unknown keys are ignored.
pub fn parse_binfmt_descriptor(name: &str, text: &str) -> Result<FormatHandler> {
    let fail = |reason: String| Error::DescriptorParse {
        name: name.to_string(),
        reason,
    };

    let arch_name = name.strip_prefix(EMULATOR_PREFIX).unwrap_or(name);
    let arch_name = arch_name
        .strip_suffix(STATIC_EMULATOR_SUFFIX)
        .unwrap_or(arch_name);
    let arch = normalize_arch(arch_name);

    let mut enabled = None;
    let mut interpreter = None;
    let mut flags = Vec::new();
    let mut offset = 0u64;
    let mut magic = None;
    let mut mask = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };

        match key.trim_end_matches(':') {
            "enabled" => enabled = Some(true),
            "disabled" => enabled = Some(false),
            "interpreter" => interpreter = Some(PathBuf::from(value)),
            "flags" => flags = DispatchFlag::parse_all(value),
            "offset" => {
                offset = value
                    .parse()
                    .map_err(|_| fail(format!("invalid offset '{}'", value)))?;
            }
            "magic" => magic = Some(decode_hex(value).map_err(fail)?),
            "mask" => mask = decode_hex(value).map_err(fail)?,
            "extension" => {
                return Err(fail("extension-matched registrations are not supported".to_string()));
            }
            other => debug!(descriptor = %name, key = %other, "ignoring descriptor key"),
        }
    }

    let enabled = enabled.ok_or_else(|| fail("missing enabled/disabled status".to_string()))?;
    let interpreter = interpreter.ok_or_else(|| fail("missing interpreter".to_string()))?;
    let magic = magic.ok_or_else(|| fail("missing magic".to_string()))?;

    let source = HandlerSource::KernelRegistered {
        name: name.to_string(),
        interpreter,
        flags,
        enabled,
    };
    FormatHandler::new(arch, OsFamily::Linux, source, magic, mask)
        .map(|handler| handler.with_offset(offset))
        .map_err(|e| fail(e.to_string()))
}

/// Registry discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Kernel format-registration directory.
    pub binfmt_dir: PathBuf,
    /// Directories searched for emulators and translators.
    pub search_path: Vec<PathBuf>,
    /// Host the handlers are discovered for.
    pub host: Platform,
    /// Marker file whose presence means Rosetta is installed (macOS).
    pub rosetta_runtime: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();

        Self {
            binfmt_dir: PathBuf::from(BINFMT_MISC_DIR),
            search_path,
            host: Platform::detect(),
            rosetta_runtime: PathBuf::from(ROSETTA_RUNTIME_PATH),
        }
    }
}

impl RegistryConfig {
    /// Overrides the binfmt directory.
    pub fn with_binfmt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binfmt_dir = dir.into();
        self
    }

    /// Overrides the search path.
    pub fn with_search_path(mut self, path: Vec<PathBuf>) -> Self {
        self.search_path = path;
        self
    }

    /// Overrides the host platform.
    pub fn with_host(mut self, host: Platform) -> Self {
        self.host = host;
        self
    }

    /// Overrides the Rosetta marker path.
    pub fn with_rosetta_runtime(mut self, path: impl Into<PathBuf>) -> Self {
        self.rosetta_runtime = path.into();
        self
    }
}

/// Discovers binary-format handlers on the host.
#[derive(Debug, Clone, Default)]
pub struct EmulatorRegistry {
    config: RegistryConfig,
}

impl EmulatorRegistry {
    /// Creates a registry for the detected host with default paths.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with explicit settings.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self { config }
    }

    /// Returns the discovery settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Enumerates handlers in precedence order (first = highest).
    ///
    /// Discovery reads host state only; calling it twice without host
    /// changes yields the same list in the same order.
    pub fn discover(&self) -> Result<Vec<FormatHandler>> {
        let host = &self.config.host;
        if !host.supports_format_registration() {
            return self.host_transparent_table();
        }

        let native = native_architectures(host);
        let kernel = self.kernel_handlers();
        let covered: HashSet<&str> = kernel.iter().map(|h| h.arch.as_str()).collect();

        let fallback: Vec<FormatHandler> = builtin_architectures()
            .filter(|arch| !covered.contains(arch) && !native.iter().any(|n| n == arch))
            .filter_map(|arch| self.static_fallback_handler(arch))
            .collect();

        let translators: Vec<FormatHandler> = [(X86_64_TRANSLATOR, "x86_64"), (I386_TRANSLATOR, "i386")]
            .into_iter()
            .filter(|(_, arch)| !native.iter().any(|n| n == arch))
            .filter_map(|(name, arch)| self.translator_handler(name, arch))
            .collect();

        let mut handlers = Vec::with_capacity(translators.len() + kernel.len() + fallback.len() + 2);
        handlers.extend(translators);
        handlers.extend(kernel);
        handlers.extend(fallback);
        handlers.extend(native.iter().filter_map(|arch| native_handler(arch)));

        info!(
            host = %host,
            count = handlers.len(),
            "discovered format handlers"
        );
        Ok(handlers)
    }

    /// Returns discovered handlers for one architecture, in precedence order.
    pub fn handlers_for(&self, arch: &str) -> Result<Vec<FormatHandler>> {
        let arch = normalize_arch(arch);
        Ok(self
            .discover()?
            .into_iter()
            .filter(|h| h.arch == arch)
            .collect())
    }

    /// Reads `qemu-*` registrations from the kernel, sorted by name.
    fn kernel_handlers(&self) -> Vec<FormatHandler> {
        let dir = &self.config.binfmt_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "binfmt directory not readable");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(EMULATOR_PREFIX))
            .collect();
        names.sort();

        names
            .iter()
            .filter_map(|name| {
                let path = dir.join(name);
                match read_descriptor(&path).and_then(|text| parse_binfmt_descriptor(name, &text)) {
                    Ok(handler) => {
                        debug!(handler = %handler, "kernel-registered handler");
                        Some(handler)
                    }
                    Err(e) => {
                        warn!(descriptor = %path.display(), error = %e, "skipping format registration");
                        None
                    }
                }
            })
            .collect()
    }

    /// Pairs a built-in signature with a standalone emulator, if one exists.
    fn static_fallback_handler(&self, arch: &str) -> Option<FormatHandler> {
        let (magic, mask) = builtin_signature(arch)?;
        let static_name = format!("{}{}{}", EMULATOR_PREFIX, arch, STATIC_EMULATOR_SUFFIX);
        let dynamic_name = format!("{}{}", EMULATOR_PREFIX, arch);

        let (emulator, statically_linked) = match which(&static_name, &self.config.search_path) {
            Some(path) => (path, true),
            None => (which(&dynamic_name, &self.config.search_path)?, false),
        };

        debug!(arch = %arch, emulator = %emulator.display(), "standalone emulator found");
        let source = HandlerSource::StaticFallback {
            emulator,
            statically_linked,
        };
        FormatHandler::new(arch, OsFamily::Linux, source, magic, mask).ok()
    }

    fn translator_handler(&self, name: &str, arch: &str) -> Option<FormatHandler> {
        let translator = which(name, &self.config.search_path)?;
        let (magic, mask) = builtin_signature(arch)?;

        debug!(arch = %arch, translator = %translator.display(), "dynamic translator found");
        let source = HandlerSource::TranslatorOverride { translator };
        FormatHandler::new(arch, OsFamily::Linux, source, magic, mask).ok()
    }

    /// Guests that hosts without format registration run transparently.
    fn host_transparent_table(&self) -> Result<Vec<FormatHandler>> {
        let host = &self.config.host;
        let entry = |arch: &str, magic: &[u8], source: HandlerSource| {
            FormatHandler::new(arch, host.os.clone(), source, magic.to_vec(), Vec::new())
        };
        let via = |mechanism: &str| HandlerSource::HostTransparent {
            mechanism: mechanism.to_string(),
        };

        let mut handlers = Vec::new();
        match (&host.os, host.arch.as_str()) {
            (OsFamily::Darwin, "aarch64") => {
                if self.config.rosetta_runtime.exists() {
                    handlers.push(entry("x86_64", MACHO_X86_64_MAGIC, via("rosetta"))?);
                }
                handlers.push(entry("aarch64", MACHO_ARM64_MAGIC, HandlerSource::Native)?);
            }
            (OsFamily::Darwin, "x86_64") => {
                handlers.push(entry("x86_64", MACHO_X86_64_MAGIC, HandlerSource::Native)?);
            }
            (OsFamily::Windows, "aarch64") => {
                handlers.push(entry("x86_64", PE_MAGIC, via("x64-emulation"))?);
                handlers.push(entry("i386", PE_MAGIC, via("wow64"))?);
                handlers.push(entry("aarch64", PE_MAGIC, HandlerSource::Native)?);
            }
            (OsFamily::Windows, "x86_64") => {
                handlers.push(entry("i386", PE_MAGIC, via("wow64"))?);
                handlers.push(entry("x86_64", PE_MAGIC, HandlerSource::Native)?);
            }
            _ => {}
        }

        if handlers.is_empty() {
            return Err(Error::UnsupportedHost {
                host: host.pair(),
            });
        }
        Ok(handlers)
    }
}

/// Handler for an architecture the host executes directly.
fn native_handler(arch: &str) -> Option<FormatHandler> {
    let (magic, mask) = builtin_signature(arch)?;
    FormatHandler::new(arch, OsFamily::Linux, HandlerSource::Native, magic, mask).ok()
}

fn read_descriptor(path: &Path) -> Result<String> {
    let mut text = String::new();
    fs::File::open(path)?
        .take(MAX_DESCRIPTOR_SIZE)
        .read_to_string(&mut text)?;
    Ok(text)
}
