//! Host platform detection and canonical architecture tags.
//!
//! Architecture tags follow the user-mode emulator naming scheme
//! (`x86_64`, `aarch64`, `arm`, `ppc64`, `riscv64`, ...) so that a tag taken
//! from an executable header, an emulator registration name, and the host
//! all compare equal with plain string equality.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating-system family of a host or an executable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OsFamily {
    Linux,
    Darwin,
    Windows,
    FreeBsd,
    NetBsd,
    OpenBsd,
    Solaris,
    /// Any family without a dedicated variant, kept by name.
    Other(String),
}

impl OsFamily {
    /// Returns the lowercase tag used in `os/arch` pairs.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
            Self::FreeBsd => "freebsd",
            Self::NetBsd => "netbsd",
            Self::OpenBsd => "openbsd",
            Self::Solaris => "solaris",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for OsFamily {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Self::Linux,
            "darwin" | "macos" => Self::Darwin,
            "windows" => Self::Windows,
            "freebsd" => Self::FreeBsd,
            "netbsd" => Self::NetBsd,
            "openbsd" => Self::OpenBsd,
            "solaris" => Self::Solaris,
            _ => Self::Other(s),
        }
    }
}

impl From<OsFamily> for String {
    fn from(os: OsFamily) -> Self {
        os.as_str().to_string()
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes common aliases to the canonical architecture tag.
///
/// Unknown names are lowercased and otherwise passed through.
pub fn normalize_arch(arch: &str) -> String {
    let lower = arch.trim().to_ascii_lowercase();
    match lower.as_str() {
        "amd64" | "x86-64" | "x64" => "x86_64".to_string(),
        "arm64" | "armv8" => "aarch64".to_string(),
        "x86" | "386" | "i486" | "i586" | "i686" => "i386".to_string(),
        "armhf" | "armel" | "armv7" | "armv7l" | "armv6l" => "arm".to_string(),
        "powerpc" => "ppc".to_string(),
        "powerpc64" => "ppc64".to_string(),
        "powerpc64le" => "ppc64le".to_string(),
        _ => lower,
    }
}

/// Detected host platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating-system family.
    pub os: OsFamily,
    /// Canonical architecture tag.
    pub arch: String,
    /// Kernel release (if detectable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
}

impl Platform {
    /// Detects the current platform.
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
            arch: Self::detect_arch(),
            kernel_version: Self::detect_kernel_version(),
        }
    }

    /// Builds a platform description without probing the host.
    pub fn new(os: OsFamily, arch: impl AsRef<str>) -> Self {
        Self {
            os,
            arch: normalize_arch(arch.as_ref()),
            kernel_version: None,
        }
    }

    fn detect_os() -> OsFamily {
        #[cfg(target_os = "linux")]
        return OsFamily::Linux;

        #[cfg(target_os = "macos")]
        return OsFamily::Darwin;

        #[cfg(target_os = "windows")]
        return OsFamily::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return OsFamily::from(std::env::consts::OS.to_string());
    }

    fn detect_arch() -> String {
        #[cfg(all(target_arch = "powerpc64", target_endian = "little"))]
        return "ppc64le".to_string();

        #[cfg(not(all(target_arch = "powerpc64", target_endian = "little")))]
        return normalize_arch(std::env::consts::ARCH);
    }

    fn detect_kernel_version() -> Option<String> {
        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("uname")
                .arg("-r")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        }

        #[cfg(not(unix))]
        None
    }

    /// Returns true if the kernel supports binary-format registration.
    pub fn supports_format_registration(&self) -> bool {
        self.os == OsFamily::Linux
    }

    /// Returns the `os/arch` pair (e.g., "linux/x86_64").
    pub fn pair(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kernel_version {
            Some(kernel) => write!(f, "{} (kernel {})", self.pair(), kernel),
            None => f.write_str(&self.pair()),
        }
    }
}
