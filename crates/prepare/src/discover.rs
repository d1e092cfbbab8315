//! Discovery of source files under a target directory.
//!
//! Walks the tree depth-first and returns every regular file as a path
//! relative to the target, using `/` separators regardless of platform.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Filesystem artifacts that are never served (case-sensitive match on the entry name).
pub const IGNORED_ENTRIES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// Errors raised while listing the target directory.
#[derive(Debug, Error)]
pub enum DiscoverError {
    /// The target does not exist or is not a directory.
    #[error("Target `{}` is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// Reading a directory or entry failed mid-walk.
    #[error("Failed to walk `{}`: {source}", path.display())]
    Walk { path: PathBuf, source: io::Error },

    /// A file's relative path is not valid UTF-8 and cannot appear in a manifest.
    #[error("File path `{}` is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),
}

/// Checks whether an entry name is on the ignore list.
pub fn is_ignored(name: &str) -> bool {
    IGNORED_ENTRIES.contains(&name)
}

/// Lists regular files under `target_dir`.
///
/// - Ignored entries are skipped; an ignored directory is skipped with its contents
/// - Symlinks are neither followed nor returned
/// - Devices, sockets and FIFOs are excluded
///
/// The order follows directory enumeration; sort the result when determinism matters.
pub fn discover(target_dir: &Path) -> Result<Vec<String>, DiscoverError> {
    let metadata = std::fs::metadata(target_dir)
        .map_err(|_| DiscoverError::NotADirectory(target_dir.to_path_buf()))?;
    if !metadata.is_dir() {
        return Err(DiscoverError::NotADirectory(target_dir.to_path_buf()));
    }

    let walker = WalkDir::new(target_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            // The root is never filtered, whatever its name
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(is_ignored)
                    .unwrap_or(false)
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(target_dir).to_path_buf();
            DiscoverError::Walk {
                path,
                source: e.into(),
            }
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(target_dir)
            .unwrap_or_else(|_| entry.path());
        let relative = to_slash_path(relative)
            .ok_or_else(|| DiscoverError::NonUtf8Path(entry.path().to_path_buf()))?;
        files.push(relative);
    }

    Ok(files)
}

/// Joins the components of a relative path with `/`; `None` if one is not UTF-8.
fn to_slash_path(path: &Path) -> Option<String> {
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}
