//! Binary-format handlers and masked-magic matching.
//!
//! A [`FormatHandler`] says "files whose bytes at `offset`, after applying
//! `mask`, equal `magic & mask` can be executed for `arch` through
//! `interpreter`". Where the handler came from is carried by
//! [`HandlerSource`], which only holds the fields meaningful for that source.

use crate::constants::MAX_MAGIC_LEN;
use crate::error::{Error, Result};
use crate::platform::OsFamily;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Kernel dispatch flag of a registered format handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchFlag {
    /// `F`: interpreter opened at registration time.
    FixBinary,
    /// `C`: credentials computed from the target binary.
    Credentials,
    /// `O`: interpreter receives an open file descriptor.
    OpenBinary,
    /// `P`: original `argv[0]` preserved.
    PreserveArgv0,
    /// Any other code, kept verbatim.
    Unknown(char),
}

impl DispatchFlag {
    /// Maps a single flag character.
    pub fn from_char(c: char) -> Self {
        match c {
            'F' => Self::FixBinary,
            'C' => Self::Credentials,
            'O' => Self::OpenBinary,
            'P' => Self::PreserveArgv0,
            other => Self::Unknown(other),
        }
    }

    /// Returns the flag character.
    pub fn as_char(&self) -> char {
        match self {
            Self::FixBinary => 'F',
            Self::Credentials => 'C',
            Self::OpenBinary => 'O',
            Self::PreserveArgv0 => 'P',
            Self::Unknown(c) => *c,
        }
    }

    /// Parses a flag string such as `"POCF"`; whitespace is ignored.
    pub fn parse_all(flags: &str) -> Vec<Self> {
        flags
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(Self::from_char)
            .collect()
    }
}

/// Where a handler came from.
///
/// Each variant carries only what is meaningful for that source; the
/// interpreter and dispatch behavior of a [`FormatHandler`] are derived
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HandlerSource {
    /// Registered with the kernel's format-dispatch facility.
    KernelRegistered {
        name: String,
        interpreter: PathBuf,
        flags: Vec<DispatchFlag>,
        /// Registration status; an enabled entry is dispatched by the kernel.
        enabled: bool,
    },
    /// Built-in magic table matched with a standalone emulator on the path.
    StaticFallback {
        emulator: PathBuf,
        statically_linked: bool,
    },
    /// Fast dynamic translator found on the path.
    TranslatorOverride { translator: PathBuf },
    /// Guest the host OS runs transparently (e.g., Rosetta on macOS).
    HostTransparent { mechanism: String },
    /// The host's own architecture.
    Native,
}

impl HandlerSource {
    /// Precedence rank; higher wins when several handlers match.
    pub fn rank(&self) -> u8 {
        match self {
            Self::TranslatorOverride { .. } => 4,
            Self::KernelRegistered { .. } => 3,
            Self::StaticFallback { .. } => 2,
            Self::HostTransparent { .. } => 1,
            Self::Native => 0,
        }
    }

    /// Short label for logs and listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::KernelRegistered { .. } => "kernel",
            Self::StaticFallback { .. } => "emulator",
            Self::TranslatorOverride { .. } => "translator",
            Self::HostTransparent { .. } => "host",
            Self::Native => "native",
        }
    }
}

/// A binary-format handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatHandler {
    /// Architecture tag this handler executes.
    pub arch: String,
    /// OS family of the binaries it executes.
    pub os: OsFamily,
    magic: Vec<u8>,
    mask: Vec<u8>,
    /// Byte offset of the magic within the file.
    pub offset: u64,
    /// Origin of this handler.
    pub source: HandlerSource,
}

impl FormatHandler {
    /// Creates a handler matching `magic` at offset 0, enforcing
    /// `magic.len() == mask.len()`.
    ///
    /// An empty `mask` means "compare every byte" and is expanded to
    /// all-`0xff`.
    pub fn new(
        arch: impl Into<String>,
        os: OsFamily,
        source: HandlerSource,
        magic: Vec<u8>,
        mask: Vec<u8>,
    ) -> Result<Self> {
        let arch = arch.into();
        let mask = if mask.is_empty() {
            vec![0xff; magic.len()]
        } else {
            mask
        };

        if magic.is_empty() {
            return Err(Error::InvalidHandler {
                arch,
                reason: "magic is empty".to_string(),
            });
        }
        if magic.len() > MAX_MAGIC_LEN {
            return Err(Error::InvalidHandler {
                arch,
                reason: format!("magic exceeds {} bytes", MAX_MAGIC_LEN),
            });
        }
        if magic.len() != mask.len() {
            return Err(Error::InvalidHandler {
                arch,
                reason: format!(
                    "magic is {} bytes but mask is {} bytes",
                    magic.len(),
                    mask.len()
                ),
            });
        }

        Ok(Self {
            arch,
            os,
            magic,
            mask,
            offset: 0,
            source,
        })
    }

    /// Moves the magic to byte `offset` of the file.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Magic byte sequence.
    pub fn magic(&self) -> &[u8] {
        &self.magic
    }

    /// Mask applied to both magic and file bytes before comparison.
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Interpreter command; `None` means the file runs as-is.
    pub fn interpreter(&self) -> Option<&Path> {
        match &self.source {
            HandlerSource::KernelRegistered { interpreter, .. } => Some(interpreter),
            HandlerSource::StaticFallback { emulator, .. } => Some(emulator),
            HandlerSource::TranslatorOverride { translator } => Some(translator),
            HandlerSource::HostTransparent { .. } | HandlerSource::Native => None,
        }
    }

    /// True if matching files run without wrapping: the kernel dispatches
    /// them itself, the host translates them, or they are native.
    pub fn auto_dispatch(&self) -> bool {
        match &self.source {
            HandlerSource::KernelRegistered { enabled, .. } => *enabled,
            HandlerSource::StaticFallback { .. } | HandlerSource::TranslatorOverride { .. } => false,
            HandlerSource::HostTransparent { .. } | HandlerSource::Native => true,
        }
    }

    /// Kernel dispatch flags; empty for handlers not registered with the kernel.
    pub fn flags(&self) -> &[DispatchFlag] {
        match &self.source {
            HandlerSource::KernelRegistered { flags, .. } => flags,
            _ => &[],
        }
    }

    /// Returns true if the file must be explicitly wrapped with the interpreter.
    pub fn requires_wrapping(&self) -> bool {
        !self.auto_dispatch()
    }

    /// Compares `bytes` (taken from the file at `offset`) under the mask.
    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.magic.len()
            && self
                .magic
                .iter()
                .zip(&self.mask)
                .zip(bytes)
                .all(|((m, k), b)| (b & k) == (m & k))
    }

    /// Probes a reader at this handler's offset.
    ///
    /// The reader is rewound to offset 0 afterwards regardless of outcome, so
    /// handlers can be tried one after another against the same stream.
    pub fn probe<R: Read + Seek>(&self, reader: &mut R) -> Result<bool> {
        reader.seek(SeekFrom::Start(self.offset))?;
        let mut window = Vec::with_capacity(self.magic.len());
        let read = reader
            .by_ref()
            .take(self.magic.len() as u64)
            .read_to_end(&mut window);
        reader.seek(SeekFrom::Start(0))?;
        read?;
        Ok(self.matches_bytes(&window))
    }

    /// Builds the command line that runs `program` under this handler.
    pub fn command_for(&self, program: &Path, args: &[OsString]) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if self.requires_wrapping()
            && let Some(interpreter) = self.interpreter()
        {
            argv.push(interpreter.as_os_str().to_os_string());
        }
        argv.push(program.as_os_str().to_os_string());
        argv.extend(args.iter().cloned());
        argv
    }
}

impl fmt::Display for FormatHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} [{}]", self.os, self.arch, self.source.label())?;
        if let Some(interpreter) = self.interpreter() {
            write!(f, " via {}", interpreter.display())?;
        }
        if self.auto_dispatch() {
            write!(f, " (auto)")?;
        }
        Ok(())
    }
}

/// Decodes a hex string (`"7f454c46"`, `\x` escapes allowed) into bytes.
pub fn decode_hex(s: &str) -> std::result::Result<Vec<u8>, String> {
    let cleaned: String = s
        .replace("\\x", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid hex string: {}", s));
    }
    if cleaned.len() % 2 != 0 {
        return Err(format!("odd-length hex string: {}", s));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|e| format!("invalid hex byte '{}': {}", &cleaned[i..i + 2], e))
        })
        .collect()
}
