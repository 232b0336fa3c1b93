//! # Executable Header Inspection
//!
//! Identifies the operating-system family and CPU architecture an executable
//! was built for, reading only the leading identification bytes and the one
//! format-specific machine field:
//!
//! | Format  | Classified by                 | Machine field                        |
//! |---------|-------------------------------|--------------------------------------|
//! | ELF     | `\x7fELF` + class/data bytes  | `e_machine` at 18, `EI_OSABI` at 7   |
//! | PE      | `MZ` DOS stub                 | COFF `Machine` after `PE\0\0`        |
//! | Mach-O  | `MH_MAGIC[_64]` (either order)| `cputype` at 4                       |
//! | Fat     | `FAT_MAGIC` (big-endian)      | first `fat_arch.cputype` at 8        |
//!
//! The architecture mapping is total: recognized machine codes become
//! canonical tags, everything else becomes the lowercased symbolic name the
//! format itself uses, and codes without any name become `unknown-0x....`.

use crate::error::{Error, Result};
use crate::platform::OsFamily;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use goblin::Hint;
use goblin::elf::header as elf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Number of identification bytes read before any format-specific field.
const IDENT_LEN: usize = 16;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_OSABI: usize = 7;
/// Offset of `e_machine`, identical for ELF32 and ELF64.
const E_MACHINE_OFFSET: u64 = 18;

const EM_LOONGARCH: u16 = 258;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM_64: u32 = 0xcffa_edfe;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_POWERPC: u32 = 18;

/// Executable container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Elf,
    Pe,
    MachO,
    MachOFat,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elf => write!(f, "ELF"),
            Self::Pe => write!(f, "PE"),
            Self::MachO => write!(f, "Mach-O"),
            Self::MachOFat => write!(f, "Mach-O (fat)"),
        }
    }
}

/// OS family and architecture declared by an executable's header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutableProfile {
    /// Container format the header was parsed as.
    pub format: ContainerFormat,
    /// Declared operating-system family.
    pub os: OsFamily,
    /// Canonical architecture tag.
    pub arch: String,
}

impl ExecutableProfile {
    /// Returns the `os/arch` pair (e.g., "linux/aarch64").
    pub fn pair(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }
}

impl fmt::Display for ExecutableProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.format, self.pair())
    }
}

/// Inspects the executable at `path`.
pub fn inspect(path: &Path) -> Result<ExecutableProfile> {
    let mut file = File::open(path)?;
    let profile = inspect_reader(&mut file, &path.display().to_string())?;
    debug!(path = %path.display(), profile = %profile, "inspected executable");
    Ok(profile)
}

/// Inspects an executable from any seekable reader.
///
/// `label` names the source in error messages. The reader is left
/// positioned just past the last byte examined.
pub fn inspect_reader<R: Read + Seek>(reader: &mut R, label: &str) -> Result<ExecutableProfile> {
    reader.seek(SeekFrom::Start(0))?;
    let mut ident = Vec::with_capacity(IDENT_LEN);
    reader.by_ref().take(IDENT_LEN as u64).read_to_end(&mut ident)?;

    let ident: [u8; IDENT_LEN] = match ident.as_slice().try_into() {
        Ok(full) => full,
        Err(_) => {
            return Err(match short_magic_format(&ident) {
                Some(format) => truncated(format, label),
                None => unsupported(label),
            });
        }
    };

    let hint = goblin::peek_bytes(&ident).map_err(|_| unsupported(label))?;
    match hint {
        Hint::Elf(_) => inspect_elf(reader, &ident, label),
        Hint::PE => inspect_pe(reader, label),
        Hint::Mach(_) => inspect_macho(&ident, label),
        Hint::MachFat(_) => Ok(inspect_fat(&ident)),
        _ => Err(unsupported(label)),
    }
}

fn unsupported(label: &str) -> Error {
    Error::UnsupportedFormat {
        path: label.to_string(),
    }
}

fn truncated(format: ContainerFormat, label: &str) -> Error {
    Error::TruncatedHeader {
        format: format.to_string(),
        path: label.to_string(),
    }
}

/// Recognizes a container magic in a file shorter than the ident block.
fn short_magic_format(bytes: &[u8]) -> Option<ContainerFormat> {
    if bytes.starts_with(elf::ELFMAG) {
        return Some(ContainerFormat::Elf);
    }
    if bytes.starts_with(b"MZ") {
        return Some(ContainerFormat::Pe);
    }
    if bytes.len() >= 4 {
        let magic = LittleEndian::read_u32(&bytes[..4]);
        if matches!(magic, MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64) {
            return Some(ContainerFormat::MachO);
        }
    }
    None
}

// =============================================================================
// ELF
// =============================================================================

fn inspect_elf<R: Read + Seek>(
    reader: &mut R,
    ident: &[u8; IDENT_LEN],
    label: &str,
) -> Result<ExecutableProfile> {
    let is_64 = ident[EI_CLASS] == ELFCLASS64;
    let is_lsb = ident[EI_DATA] == ELFDATA2LSB;

    reader.seek(SeekFrom::Start(E_MACHINE_OFFSET))?;
    let machine = if is_lsb {
        reader.read_u16::<LittleEndian>()
    } else {
        reader.read_u16::<BigEndian>()
    }
    .map_err(|_| truncated(ContainerFormat::Elf, label))?;

    Ok(ExecutableProfile {
        format: ContainerFormat::Elf,
        os: elf_os_family(ident[EI_OSABI]),
        arch: elf_arch(machine, is_64, is_lsb),
    })
}

/// Maps `EI_OSABI` to an OS family. SYSV (0) is what Linux toolchains emit.
fn elf_os_family(osabi: u8) -> OsFamily {
    match osabi {
        0 | 3 => OsFamily::Linux,
        2 => OsFamily::NetBsd,
        6 => OsFamily::Solaris,
        9 => OsFamily::FreeBsd,
        12 => OsFamily::OpenBsd,
        other => OsFamily::Other(format!("elf-osabi-{}", other)),
    }
}

/// Maps an ELF `e_machine` value to an architecture tag.
pub fn elf_arch(machine: u16, is_64: bool, is_lsb: bool) -> String {
    let tag = match machine {
        elf::EM_386 => "i386",
        elf::EM_X86_64 => "x86_64",
        elf::EM_ARM => "arm",
        elf::EM_AARCH64 => "aarch64",
        elf::EM_PPC => "ppc",
        elf::EM_PPC64 if is_lsb => "ppc64le",
        elf::EM_PPC64 => "ppc64",
        elf::EM_RISCV if is_64 => "riscv64",
        elf::EM_RISCV => "riscv32",
        elf::EM_MIPS => match (is_64, is_lsb) {
            (true, true) => "mips64el",
            (true, false) => "mips64",
            (false, true) => "mipsel",
            (false, false) => "mips",
        },
        elf::EM_S390 if is_64 => "s390x",
        elf::EM_S390 => "s390",
        elf::EM_SPARC => "sparc",
        elf::EM_SPARCV9 => "sparc64",
        EM_LOONGARCH => "loongarch64",
        other => return symbolic_fallback(elf::machine_to_str(other), other),
    };
    tag.to_string()
}

/// Lowercases a format-provided symbolic name, or falls back to the raw code.
fn symbolic_fallback(name: &str, code: u16) -> String {
    if name.is_empty() || name.to_ascii_uppercase().starts_with("UNKNOWN") {
        format!("unknown-0x{:04x}", code)
    } else {
        name.to_ascii_lowercase()
    }
}

// =============================================================================
// PE
// =============================================================================

const PE_POINTER_OFFSET: u64 = 0x3c;
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";

/// `IMAGE_FILE_MACHINE_*` names for machines without a canonical tag.
const PE_MACHINE_NAMES: &[(u16, &str)] = &[
    (0x0000, "UNKNOWN"),
    (0x0184, "ALPHA"),
    (0x0284, "ALPHA64"),
    (0x01d3, "AM33"),
    (0x0ebc, "EBC"),
    (0x0200, "IA64"),
    (0x9041, "M32R"),
    (0x0266, "MIPS16"),
    (0x0366, "MIPSFPU"),
    (0x0466, "MIPSFPU16"),
    (0x01f1, "POWERPCFP"),
    (0x0162, "R3000"),
    (0x0168, "R10000"),
    (0x5128, "RISCV128"),
    (0x01a2, "SH3"),
    (0x01a3, "SH3DSP"),
    (0x01a6, "SH4"),
    (0x01a8, "SH5"),
    (0x0169, "WCEMIPSV2"),
];

fn inspect_pe<R: Read + Seek>(reader: &mut R, label: &str) -> Result<ExecutableProfile> {
    let eof = |_| truncated(ContainerFormat::Pe, label);

    reader.seek(SeekFrom::Start(PE_POINTER_OFFSET))?;
    let pe_offset = reader.read_u32::<LittleEndian>().map_err(eof)?;

    reader.seek(SeekFrom::Start(u64::from(pe_offset)))?;
    let mut signature = [0u8; 4];
    reader.read_exact(&mut signature).map_err(eof)?;
    if &signature != PE_SIGNATURE {
        // A bare DOS executable carries no machine field.
        return Err(unsupported(label));
    }
    let machine = reader.read_u16::<LittleEndian>().map_err(eof)?;

    Ok(ExecutableProfile {
        format: ContainerFormat::Pe,
        os: OsFamily::Windows,
        arch: pe_arch(machine),
    })
}

/// Maps a COFF `Machine` value to an architecture tag.
pub fn pe_arch(machine: u16) -> String {
    let tag = match machine {
        0x014c => "i386",
        0x8664 => "x86_64",
        0xaa64 | 0xa641 => "aarch64",
        0x01c0 | 0x01c2 | 0x01c4 => "arm",
        0x01f0 => "ppc",
        0x0166 => "mipsel",
        0x5032 => "riscv32",
        0x5064 => "riscv64",
        0x6232 => "loongarch32",
        0x6264 => "loongarch64",
        other => {
            let name = PE_MACHINE_NAMES
                .iter()
                .find(|(code, _)| *code == other)
                .map(|(_, name)| *name)
                .unwrap_or("");
            return symbolic_fallback(name, other);
        }
    };
    tag.to_string()
}

// =============================================================================
// Mach-O
// =============================================================================

fn inspect_macho(ident: &[u8; IDENT_LEN], label: &str) -> Result<ExecutableProfile> {
    let magic = LittleEndian::read_u32(&ident[0..4]);
    let (cputype, cpusubtype) = match magic {
        MH_MAGIC | MH_MAGIC_64 => (
            LittleEndian::read_u32(&ident[4..8]),
            LittleEndian::read_u32(&ident[8..12]),
        ),
        MH_CIGAM | MH_CIGAM_64 => (
            BigEndian::read_u32(&ident[4..8]),
            BigEndian::read_u32(&ident[8..12]),
        ),
        _ => return Err(unsupported(label)),
    };

    Ok(ExecutableProfile {
        format: ContainerFormat::MachO,
        os: OsFamily::Darwin,
        arch: macho_arch(cputype, cpusubtype),
    })
}

/// Uses the first architecture of a universal binary.
fn inspect_fat(ident: &[u8; IDENT_LEN]) -> ExecutableProfile {
    let cputype = BigEndian::read_u32(&ident[8..12]);
    let cpusubtype = BigEndian::read_u32(&ident[12..16]);
    ExecutableProfile {
        format: ContainerFormat::MachOFat,
        os: OsFamily::Darwin,
        arch: macho_arch(cputype, cpusubtype),
    }
}

/// Maps a Mach-O `cputype` to an architecture tag.
pub fn macho_arch(cputype: u32, cpusubtype: u32) -> String {
    let tag = match cputype {
        CPU_TYPE_X86 => "i386",
        t if t == CPU_TYPE_X86 | CPU_ARCH_ABI64 => "x86_64",
        CPU_TYPE_ARM => "arm",
        t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64 => "aarch64",
        t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64_32 => "arm64_32",
        CPU_TYPE_POWERPC => "ppc",
        t if t == CPU_TYPE_POWERPC | CPU_ARCH_ABI64 => "ppc64",
        other => {
            return match goblin::mach::cputype::get_arch_name_from_types(
                other as _,
                cpusubtype as _,
            ) {
                Some(name) => name.to_ascii_lowercase(),
                None => format!("unknown-0x{:08x}", other),
            };
        }
    };
    tag.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn elf_header(class: u8, data: u8, osabi: u8, machine: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[..4].copy_from_slice(b"\x7fELF");
        buf[EI_CLASS] = class;
        buf[EI_DATA] = data;
        buf[6] = 1;
        buf[EI_OSABI] = osabi;
        if data == ELFDATA2LSB {
            LittleEndian::write_u16(&mut buf[16..18], 2);
            LittleEndian::write_u16(&mut buf[18..20], machine);
        } else {
            BigEndian::write_u16(&mut buf[16..18], 2);
            BigEndian::write_u16(&mut buf[18..20], machine);
        }
        buf
    }

    #[test]
    fn test_elf_aarch64() {
        let buf = elf_header(2, 1, 0, elf::EM_AARCH64);
        let profile = inspect_reader(&mut Cursor::new(buf), "test").unwrap();
        assert_eq!(profile.format, ContainerFormat::Elf);
        assert_eq!(profile.os, OsFamily::Linux);
        assert_eq!(profile.arch, "aarch64");
    }

    #[test]
    fn test_elf_big_endian_ppc64() {
        let buf = elf_header(2, 2, 0, elf::EM_PPC64);
        let profile = inspect_reader(&mut Cursor::new(buf), "test").unwrap();
        assert_eq!(profile.arch, "ppc64");
    }

    #[test]
    fn test_elf_freebsd_osabi() {
        let buf = elf_header(2, 1, 9, elf::EM_X86_64);
        let profile = inspect_reader(&mut Cursor::new(buf), "test").unwrap();
        assert_eq!(profile.os, OsFamily::FreeBsd);
        assert_eq!(profile.arch, "x86_64");
    }

    #[test]
    fn test_elf_unknown_machine_not_dropped() {
        let arch = elf_arch(0xfffe, true, true);
        assert!(!arch.is_empty());
        assert_eq!(arch, arch.to_ascii_lowercase());
    }

    #[test]
    fn test_pe_machine_names() {
        assert_eq!(pe_arch(0x8664), "x86_64");
        assert_eq!(pe_arch(0x0200), "ia64");
        assert_eq!(pe_arch(0x1234), "unknown-0x1234");
    }

    #[test]
    fn test_macho_cputypes() {
        assert_eq!(macho_arch(0x0100_000c, 0), "aarch64");
        assert_eq!(macho_arch(0x0100_0007, 3), "x86_64");
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let buf = vec![0x42u8; 64];
        let err = inspect_reader(&mut Cursor::new(buf), "junk").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_short_elf_is_truncated() {
        let buf = b"\x7fELF\x02\x01".to_vec();
        let err = inspect_reader(&mut Cursor::new(buf), "short").unwrap_err();
        assert!(matches!(err, Error::TruncatedHeader { .. }));
    }
}
