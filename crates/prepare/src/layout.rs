//! Output folder layout.
//!
//! Every build writes into four sibling roots below the output directory,
//! one per [`EncodingKind`]. All four are created even when compression is
//! skipped so the manifest keeps the same shape.

use crate::encode::EncodingKind;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure to create part of the output layout.
#[derive(Debug, Error)]
#[error("Failed to create directory `{}`: {source}", path.display())]
pub struct LayoutError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Absolute root directory of each encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folders {
    pub identity: PathBuf,
    pub gzip: PathBuf,
    pub deflate: PathBuf,
    pub brotli: PathBuf,
}

impl Folders {
    /// The standard roots below `output_dir`, without touching the filesystem.
    pub fn under(output_dir: &Path) -> Self {
        Self {
            identity: output_dir.join(EncodingKind::Identity.dir_name()),
            gzip: output_dir.join(EncodingKind::Gzip.dir_name()),
            deflate: output_dir.join(EncodingKind::Deflate.dir_name()),
            brotli: output_dir.join(EncodingKind::Brotli.dir_name()),
        }
    }

    pub fn root(&self, kind: EncodingKind) -> &Path {
        match kind {
            EncodingKind::Identity => &self.identity,
            EncodingKind::Gzip => &self.gzip,
            EncodingKind::Deflate => &self.deflate,
            EncodingKind::Brotli => &self.brotli,
        }
    }

    /// Where the `kind` copy of a relative, `/`-separated file path is written.
    pub fn output_path(&self, kind: EncodingKind, relative: &str) -> PathBuf {
        let mut path = self.root(kind).to_path_buf();
        path.extend(relative.split('/').filter(|part| !part.is_empty()));
        path
    }
}

async fn create_dir(path: &Path, recursive: bool) -> Result<(), LayoutError> {
    let result = if recursive {
        tokio::fs::create_dir_all(path).await
    } else {
        tokio::fs::create_dir(path).await
    };
    result.map_err(|source| LayoutError {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates `output_dir` and the four encoding roots.
///
/// The roots themselves must not exist yet; callers remove any previous
/// output tree first.
pub async fn build_layout(output_dir: &Path) -> Result<Folders, LayoutError> {
    create_dir(output_dir, true).await?;

    let folders = Folders::under(output_dir);
    for kind in EncodingKind::ALL {
        create_dir(folders.root(kind), false).await?;
    }

    Ok(folders)
}

/// Parent directories of `files` that are not an ancestor of another one.
///
/// Creating these recursively covers every directory a file is written
/// into, with the fewest creation calls. Top-level files contribute nothing.
/// The result is sorted.
pub fn leaf_folders(files: &[String]) -> Vec<String> {
    let folders: BTreeSet<&str> = files
        .iter()
        .filter_map(|file| file.trim_start_matches('/').rsplit_once('/'))
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
        .collect();

    let mut ancestors = HashSet::new();
    for folder in &folders {
        let mut current = *folder;
        while let Some((parent, _)) = current.rsplit_once('/') {
            ancestors.insert(parent);
            current = parent;
        }
    }

    folders
        .into_iter()
        .filter(|folder| !ancestors.contains(folder))
        .map(str::to_string)
        .collect()
}

/// Pre-creates, under every encoding root, each directory `files` will be written into.
pub async fn create_file_folders(folders: &Folders, files: &[String]) -> Result<(), LayoutError> {
    let leaves = leaf_folders(files);
    for kind in EncodingKind::ALL {
        for leaf in &leaves {
            create_dir(&folders.output_path(kind, leaf), true).await?;
        }
    }
    Ok(())
}
