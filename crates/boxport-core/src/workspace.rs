//! Per-run temporary state.
//!
//! A [`Workspace`] owns the staging directory every stage writes into and the
//! temporary archive packaging produces. Both are removed exactly once by
//! [`Workspace::teardown`], which also runs on drop so a panic mid-export
//! still leaves nothing behind.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A file in the staging directory and its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifestEntry {
    /// Path relative to the staging root, no leading separator.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Every file in the staging directory, in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Entries sorted by relative path.
    pub entries: Vec<FileManifestEntry>,
    /// Sum of all entry sizes.
    pub total_size: u64,
}

impl Manifest {
    /// The relative paths, in manifest order.
    pub fn paths(&self) -> Vec<&Path> {
        self.entries.iter().map(|e| e.path.as_path()).collect()
    }

    /// Whether the staging directory holds no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Staging directory and temporary archive for one export run.
#[derive(Debug)]
pub struct Workspace {
    scratch_root: PathBuf,
    staging_dir: Option<PathBuf>,
    archive_path: Option<PathBuf>,
    torn_down: bool,
}

impl Workspace {
    /// Create a workspace that will stage under `scratch_root`.
    ///
    /// Nothing is created on disk until [`Workspace::create_staging_dir`].
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            staging_dir: None,
            archive_path: None,
            torn_down: false,
        }
    }

    /// Create the staging directory, named after the current time.
    ///
    /// Returns the existing directory if one was already created.
    pub fn create_staging_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.staging_dir {
            return Ok(dir.clone());
        }

        fs::create_dir_all(&self.scratch_root).map_err(|e| Error::io(e, &self.scratch_root))?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut attempt = 0u32;
        let dir = loop {
            let name = if attempt == 0 {
                format!("export-{}", stamp)
            } else {
                format!("export-{}-{}", stamp, attempt)
            };
            let candidate = self.scratch_root.join(name);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(Error::io(e, candidate)),
            }
        };

        debug!(staging_dir = %dir.display(), "created staging directory");
        self.staging_dir = Some(dir.clone());
        Ok(dir)
    }

    /// The staging directory, if it has been created.
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    /// The staging directory, or an error if extraction never created it.
    pub fn require_staging_dir(&self) -> Result<&Path> {
        self.staging_dir().ok_or_else(|| {
            Error::io(
                std::io::Error::new(ErrorKind::NotFound, "staging directory was not created"),
                &self.scratch_root,
            )
        })
    }

    /// Fix the temporary archive path as `<staging_dir>.box` and return it.
    pub fn assign_archive_path(&mut self) -> Result<PathBuf> {
        let staging = self.require_staging_dir()?;
        let mut name = staging.as_os_str().to_owned();
        name.push(".box");
        let path = PathBuf::from(name);
        self.archive_path = Some(path.clone());
        Ok(path)
    }

    /// The temporary archive path, once packaging has begun.
    pub fn archive_path(&self) -> Option<&Path> {
        self.archive_path.as_deref()
    }

    /// List every regular file under the staging directory with its size.
    pub fn manifest(&self) -> Result<Manifest> {
        let root = self.require_staging_dir()?;
        let mut manifest = Manifest::default();
        for relative in list_files(root)? {
            let full = root.join(&relative);
            let size = fs::metadata(&full).map_err(|e| Error::io(e, &full))?.len();
            manifest.total_size += size;
            manifest.entries.push(FileManifestEntry {
                path: relative,
                size,
            });
        }
        Ok(manifest)
    }

    /// Remove the staging directory and any leftover temporary archive.
    ///
    /// Safe to call more than once; only the first call does anything.
    /// Paths that are already gone count as removed.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(dir) = &self.staging_dir {
            match fs::remove_dir_all(dir) {
                Ok(()) => debug!(path = %dir.display(), "removed staging directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove staging directory"),
            }
        }

        if let Some(archive) = &self.archive_path {
            if archive.is_file() {
                match fs::remove_file(archive) {
                    Ok(()) => debug!(path = %archive.display(), "removed temporary archive"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %archive.display(), error = %e, "failed to remove temporary archive"),
                }
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Recursively list regular files under `root`, relative to it, sorted.
///
/// Symlinks and other special files are skipped.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(e, root))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn walk_error(err: walkdir::Error, root: &Path) -> Error {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop while listing files"));
    Error::io(source, path)
}

/// Copy `relative` from `src_root` to the same relative path under `dst_root`.
pub fn copy_relative(src_root: &Path, dst_root: &Path, relative: &Path) -> Result<()> {
    let src = src_root.join(relative);
    let dst = dst_root.join(relative);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
    }
    fs::copy(&src, &dst).map_err(|e| Error::io(e, &src))?;
    Ok(())
}
