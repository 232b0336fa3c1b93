//! # Layered Directory Views
//!
//! Read-only access to a stack of directories as one tree, independent of
//! how the stack is built.
//!
//! ## Lookup Model
//!
//! Layers are ordered highest precedence first. A relative path resolves to
//! the first layer that contains it; directory listings are the union of
//! every layer's entries, where the first occurrence of a name wins:
//!
//! ```text
//! layer 0 (upper)     layer 1 (payload)      view
//! ├── server.cfg      ├── server.cfg         ├── server.cfg   (layer 0)
//! └── world/          ├── server             ├── server       (layer 1)
//!                     └── world/             └── world/       (layers 0, 1)
//! ```
//!
//! Upper layers written by overlayfs mark deleted names with whiteouts
//! (character devices numbered 0/0). A whiteout hides the name in every
//! lower layer and is never listed itself. A non-directory in a higher
//! layer likewise hides a lower directory of the same name, along with
//! everything under it.
//!
//! [`SoftwareOverlay`] computes this in user space; [`MountedView`] reads
//! a kernel- or helper-mounted target where the filesystem already did it.
//! Both implement [`LayeredView`].
//!
//! ## Path Traversal Protection
//!
//! Relative paths must stay inside the view. Absolute paths and `..`
//! components return [`Error::PathTraversal`].
//!
//! ## Materialization
//!
//! Where no union mount is available, [`SoftwareOverlay::materialize`]
//! writes the merged tree into a real directory:
//!
//! ```rust,ignore
//! let view = SoftwareOverlay::new(vec![upper, payload]);
//! let stats = view.materialize(&merged)?;
//! println!("{} files, {} bytes", stats.files, stats.bytes);
//! ```

use crate::error::{Error, Result};
use crate::overlay::MountHandle;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// View Trait
// =============================================================================

/// Kind of a directory entry in a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    /// FIFO, socket, or device node.
    Other,
}

impl EntryKind {
    fn from_file_type(ft: fs::FileType) -> Self {
        if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_dir() {
            Self::Dir
        } else if ft.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// One name in a view listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    /// Index of the layer the entry was taken from.
    pub layer: usize,
    /// Real path backing the entry.
    pub source: PathBuf,
}

/// Read-only access to a merged directory tree.
pub trait LayeredView {
    /// Lists `rel`; names map to the entry that wins.
    fn read_dir(&self, rel: &Path) -> Result<BTreeMap<OsString, DirEntry>>;

    /// Metadata of `rel` without following a final symlink.
    fn stat(&self, rel: &Path) -> Result<Metadata>;

    /// Opens `rel` for reading.
    fn open(&self, rel: &Path) -> Result<File>;
}

/// Normalizes a view-relative path, rejecting anything that escapes it.
pub fn sanitize_relative(rel: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: rel.display().to_string(),
                });
            }
        }
    }
    Ok(clean)
}

// =============================================================================
// Software Overlay
// =============================================================================

/// Union of directories computed in user space.
#[derive(Debug, Clone)]
pub struct SoftwareOverlay {
    layers: Vec<PathBuf>,
}

/// Counts from [`SoftwareOverlay::materialize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

impl SoftwareOverlay {
    /// Creates a view over `layers`, highest precedence first.
    pub fn new(layers: Vec<PathBuf>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// First layer holding `rel`, with its index and real path.
    ///
    /// The search stops at a whiteout for `rel` and at a layer where one of
    /// its ancestors is not a directory.
    fn locate(&self, rel: &Path) -> Result<(usize, PathBuf, Metadata)> {
        let clean = sanitize_relative(rel)?;
        for (index, layer) in self.layers.iter().enumerate() {
            let candidate = layer.join(&clean);
            match fs::symlink_metadata(&candidate) {
                Ok(meta) if is_whiteout(&meta) => break,
                Ok(meta) => return Ok((index, candidate, meta)),
                Err(_) if ancestor_blocks(layer, &clean) => break,
                Err(_) => {}
            }
        }
        Err(Error::PathNotFound(clean))
    }

    /// Writes the merged tree into `dest`.
    ///
    /// `dest` is created if missing and must otherwise be empty. Regular
    /// files are copied with their permissions, symlinks are recreated as
    /// symlinks, and special files are skipped.
    pub fn materialize(&self, dest: &Path) -> Result<MaterializeStats> {
        if dest.exists() {
            let mut entries = fs::read_dir(dest)?;
            if entries.next().is_some() {
                return Err(Error::MaterializeFailed {
                    dest: dest.to_path_buf(),
                    reason: "destination is not empty".to_string(),
                });
            }
        } else {
            fs::create_dir_all(dest)?;
        }

        let mut stats = MaterializeStats::default();
        self.materialize_dir(Path::new(""), dest, &mut stats)
            .map_err(|e| Error::MaterializeFailed {
                dest: dest.to_path_buf(),
                reason: e.to_string(),
            })?;

        info!(
            dest = %dest.display(),
            layers = self.layers.len(),
            files = stats.files,
            dirs = stats.dirs,
            bytes = stats.bytes,
            "materialized layered view"
        );
        Ok(stats)
    }

    fn materialize_dir(
        &self,
        rel: &Path,
        dest: &Path,
        stats: &mut MaterializeStats,
    ) -> Result<()> {
        for (name, entry) in self.read_dir(rel)? {
            let child_rel = rel.join(&name);
            let target = dest.join(&child_rel);

            match entry.kind {
                EntryKind::Dir => {
                    fs::create_dir(&target)?;
                    self.materialize_dir(&child_rel, dest, stats)?;
                    let perms = fs::metadata(&entry.source)?.permissions();
                    fs::set_permissions(&target, perms)?;
                    stats.dirs += 1;
                }
                EntryKind::File => {
                    stats.bytes += fs::copy(&entry.source, &target)?;
                    stats.files += 1;
                }
                EntryKind::Symlink => {
                    let link = fs::read_link(&entry.source)?;
                    make_symlink(&link, &target)?;
                    stats.symlinks += 1;
                }
                EntryKind::Other => {
                    debug!(path = %entry.source.display(), "skipping special file");
                }
            }
        }
        Ok(())
    }
}

impl LayeredView for SoftwareOverlay {
    fn read_dir(&self, rel: &Path) -> Result<BTreeMap<OsString, DirEntry>> {
        let (first, _, meta) = self.locate(rel)?;
        if !meta.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("not a directory: {}", rel.display()),
            )));
        }

        let clean = sanitize_relative(rel)?;
        // `None` marks a name hidden by a whiteout.
        let mut merged: BTreeMap<OsString, Option<DirEntry>> = BTreeMap::new();
        for (index, layer) in self.layers.iter().enumerate().skip(first) {
            let dir = layer.join(&clean);
            match fs::symlink_metadata(&dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => break,
                Err(_) if ancestor_blocks(layer, &clean) => break,
                Err(_) => continue,
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let kind = EntryKind::from_file_type(entry.file_type()?);
                let name = entry.file_name();
                if merged.contains_key(&name) {
                    continue;
                }
                let visible = if kind == EntryKind::Other && is_whiteout(&entry.metadata()?) {
                    None
                } else {
                    Some(DirEntry {
                        kind,
                        layer: index,
                        source: entry.path(),
                    })
                };
                merged.insert(name, visible);
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(name, entry)| entry.map(|entry| (name, entry)))
            .collect())
    }

    fn stat(&self, rel: &Path) -> Result<Metadata> {
        self.locate(rel).map(|(_, _, meta)| meta)
    }

    fn open(&self, rel: &Path) -> Result<File> {
        let (_, path, _) = self.locate(rel)?;
        Ok(File::open(path)?)
    }
}

// =============================================================================
// Write-Back
// =============================================================================

/// Copies every file of `merged` that differs from `base` into `upper`.
///
/// Used to keep the writes made in a materialized tree once it is torn
/// down: files identical to the base install are skipped, everything else
/// (new files, modified files, changed symlinks) lands in `upper` under the
/// same relative path. Deletions are not tracked. Returns the number of
/// entries written.
pub fn write_back(merged: &Path, base: &Path, upper: &Path) -> Result<u64> {
    let mut written = 0;
    write_back_dir(merged, base, upper, Path::new(""), &mut written)?;
    if written > 0 {
        info!(
            merged = %merged.display(),
            upper = %upper.display(),
            entries = written,
            "wrote back instance changes"
        );
    }
    Ok(written)
}

fn write_back_dir(
    merged: &Path,
    base: &Path,
    upper: &Path,
    rel: &Path,
    written: &mut u64,
) -> Result<()> {
    for entry in fs::read_dir(merged.join(rel))? {
        let entry = entry?;
        let child_rel = rel.join(entry.file_name());
        let source = entry.path();
        let original = base.join(&child_rel);
        let target = upper.join(&child_rel);

        match EntryKind::from_file_type(entry.file_type()?) {
            EntryKind::Dir => write_back_dir(merged, base, upper, &child_rel, written)?,
            EntryKind::File => {
                if original.is_file() && same_content(&source, &original)? {
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&source, &target)?;
                *written += 1;
            }
            EntryKind::Symlink => {
                let link = fs::read_link(&source)?;
                if fs::read_link(&original).ok().as_deref() == Some(link.as_path()) {
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if fs::symlink_metadata(&target).is_ok() {
                    fs::remove_file(&target)?;
                }
                make_symlink(&link, &target)?;
                *written += 1;
            }
            EntryKind::Other => {}
        }
    }
    Ok(())
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    use std::io::Read;

    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }

    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = fa.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        fb.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

// =============================================================================
// Mounted View
// =============================================================================

/// View over a target where a union filesystem is mounted.
#[derive(Debug, Clone)]
pub struct MountedView {
    root: PathBuf,
}

impl MountedView {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_handle(handle: &MountHandle) -> Self {
        Self::new(handle.target())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &Path) -> Result<PathBuf> {
        let clean = sanitize_relative(rel)?;
        let path = self.root.join(&clean);
        if fs::symlink_metadata(&path).is_err() {
            return Err(Error::PathNotFound(clean));
        }
        Ok(path)
    }
}

impl LayeredView for MountedView {
    fn read_dir(&self, rel: &Path) -> Result<BTreeMap<OsString, DirEntry>> {
        let dir = self.resolve(rel)?;
        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            entries.insert(
                entry.file_name(),
                DirEntry {
                    kind: EntryKind::from_file_type(entry.file_type()?),
                    layer: 0,
                    source: entry.path(),
                },
            );
        }
        Ok(entries)
    }

    fn stat(&self, rel: &Path) -> Result<Metadata> {
        let path = self.resolve(rel)?;
        Ok(fs::symlink_metadata(path)?)
    }

    fn open(&self, rel: &Path) -> Result<File> {
        let path = self.resolve(rel)?;
        Ok(File::open(path)?)
    }
}

/// Whether `meta` describes an overlayfs whiteout.
#[cfg(unix)]
pub fn is_whiteout(meta: &Metadata) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    meta.file_type().is_char_device() && meta.rdev() == 0
}

#[cfg(not(unix))]
pub fn is_whiteout(_meta: &Metadata) -> bool {
    false
}

/// True when a proper ancestor of `clean` exists in `layer` as something
/// other than a directory, which hides the path in lower layers.
fn ancestor_blocks(layer: &Path, clean: &Path) -> bool {
    clean
        .ancestors()
        .skip(1)
        .filter(|ancestor| !ancestor.as_os_str().is_empty())
        .any(|ancestor| {
            fs::symlink_metadata(layer.join(ancestor)).is_ok_and(|meta| !meta.is_dir())
        })
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, target: &Path) -> Result<()> {
    Err(Error::MaterializeFailed {
        dest: target.to_path_buf(),
        reason: "symlinks are not supported on this platform".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn two_layers() -> (TempDir, SoftwareOverlay) {
        let tmp = TempDir::new().unwrap();
        let top = tmp.path().join("top");
        let bottom = tmp.path().join("bottom");
        fs::create_dir_all(top.join("shared")).unwrap();
        fs::create_dir_all(bottom.join("shared")).unwrap();
        fs::write(top.join("config.txt"), "top").unwrap();
        fs::write(bottom.join("config.txt"), "bottom").unwrap();
        fs::write(bottom.join("only-bottom.txt"), "b").unwrap();
        fs::write(top.join("shared/a"), "a").unwrap();
        fs::write(bottom.join("shared/b"), "b").unwrap();
        let view = SoftwareOverlay::new(vec![top, bottom]);
        (tmp, view)
    }

    #[test]
    fn test_first_layer_wins_on_open() {
        let (_tmp, view) = two_layers();
        let mut content = String::new();
        view.open(Path::new("config.txt"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "top");
    }

    #[test]
    fn test_read_dir_is_union() {
        let (_tmp, view) = two_layers();
        let root = view.read_dir(Path::new("")).unwrap();
        assert_eq!(root.len(), 3);
        assert_eq!(root[&OsString::from("config.txt")].layer, 0);
        assert_eq!(root[&OsString::from("only-bottom.txt")].layer, 1);

        let shared = view.read_dir(Path::new("shared")).unwrap();
        let names: Vec<_> = shared.keys().cloned().collect();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("b")]);
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let (_tmp, view) = two_layers();
        assert!(matches!(
            view.stat(Path::new("nope")).unwrap_err(),
            Error::PathNotFound(_)
        ));
    }

    #[test]
    fn test_sanitize_rejects_escape() {
        assert!(sanitize_relative(Path::new("../etc/passwd")).is_err());
        assert!(sanitize_relative(Path::new("/etc/passwd")).is_err());
        assert_eq!(
            sanitize_relative(Path::new("./a/./b")).unwrap(),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn test_file_hides_lower_directory() {
        let (tmp, view) = two_layers();
        let top = tmp.path().join("top");
        fs::remove_dir_all(top.join("shared")).unwrap();
        fs::write(top.join("shared"), "now a file").unwrap();

        let root = view.read_dir(Path::new("")).unwrap();
        assert_eq!(root[&OsString::from("shared")].kind, EntryKind::File);
        assert!(matches!(
            view.stat(Path::new("shared/b")).unwrap_err(),
            Error::PathNotFound(_)
        ));
        assert!(view.read_dir(Path::new("shared")).is_err());
    }

    #[test]
    fn test_regular_files_are_not_whiteouts() {
        let (tmp, _view) = two_layers();
        let meta = fs::symlink_metadata(tmp.path().join("top/config.txt")).unwrap();
        assert!(!is_whiteout(&meta));
        let meta = fs::symlink_metadata(tmp.path().join("top")).unwrap();
        assert!(!is_whiteout(&meta));
    }

    #[test]
    fn test_mounted_view_lists_root() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("x"), "x").unwrap();
        let view = MountedView::new(tmp.path());
        let entries = view.read_dir(Path::new("")).unwrap();
        assert_eq!(entries[&OsString::from("x")].kind, EntryKind::File);
    }
}
