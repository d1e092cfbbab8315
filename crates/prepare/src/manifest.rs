//! Manifest assembly.
//!
//! Merges the computed [`FileRecord`]s with the overrides of the
//! [`BuildRequest`] into the document a server loads at startup.

use crate::encode::EncodingKind;
use crate::hash::ContentHash;
use crate::layout::Folders;
use crate::pipeline::{FileRecord, Sizes};
use crate::request::{Alias, BuildRequest, FileOverride, Headers, ValidationError};
use serde::Serialize;
use std::path::Path;

/// Status code of entries without an override.
pub const DEFAULT_STATUS_CODE: u16 = 200;

/// Everything a server needs to know about one prepared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub sizes: Sizes,
    pub hash: ContentHash,
    pub mime: String,
    pub status_code: u16,
    pub headers: Headers,
    pub env_replacements: Headers,
}

/// Encoding roots relative to the directory holding the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFolders {
    pub identity: String,
    pub gzip: String,
    pub deflate: String,
    pub brotli: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub aliases: Vec<Alias>,
    pub folders: ManifestFolders,
    pub catch_all_file: Option<ManifestEntry>,
    pub global_headers: Headers,
    pub files: Vec<ManifestEntry>,
}

/// Mime type for `path`: the override if given, else guessed from the extension.
pub fn resolve_mime(path: &str, mime: Option<&str>) -> Result<String, ValidationError> {
    if let Some(mime) = mime {
        return Ok(mime.to_string());
    }
    mime_guess::from_path(path)
        .first_raw()
        .map(str::to_string)
        .ok_or_else(|| ValidationError::MimeUndetermined {
            path: path.to_string(),
        })
}

fn relative_to(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(relative) => relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// The encoding roots of `folders`, relative to `output_dir` with `/` separators.
pub fn relative_folders(output_dir: &Path, folders: &Folders) -> ManifestFolders {
    let rel = |kind| relative_to(output_dir, folders.root(kind));
    ManifestFolders {
        identity: rel(EncodingKind::Identity),
        gzip: rel(EncodingKind::Gzip),
        deflate: rel(EncodingKind::Deflate),
        brotli: rel(EncodingKind::Brotli),
    }
}

fn entry(record: FileRecord, file: Option<&FileOverride>) -> Result<ManifestEntry, ValidationError> {
    let mime = resolve_mime(&record.path, file.and_then(|f| f.mime.as_deref()))?;
    Ok(ManifestEntry {
        mime,
        status_code: file
            .and_then(|f| f.status_code)
            .unwrap_or(DEFAULT_STATUS_CODE),
        headers: file.map(|f| f.headers.clone()).unwrap_or_default(),
        env_replacements: file.map(|f| f.env_replacements.clone()).unwrap_or_default(),
        path: record.path,
        sizes: record.sizes,
        hash: record.hash,
    })
}

/// Builds the manifest from the prepared records, in record order.
///
/// The catch-all entry, if the request names one, is moved out of `files`.
/// Fails when a mime type cannot be determined or the catch-all file was
/// not among the records.
pub fn assemble(
    request: &BuildRequest,
    folders: &Folders,
    output_dir: &Path,
    records: Vec<FileRecord>,
) -> Result<Manifest, ValidationError> {
    let overrides = request.overrides_by_path();
    let catch_all_path = request.catch_all_file.as_ref().map(|f| f.path.as_str());

    let mut files = Vec::with_capacity(records.len());
    let mut catch_all_file = None;
    for record in records {
        let file = overrides.get(record.path.as_str()).copied();
        let is_catch_all = catch_all_path == Some(record.path.as_str());
        let entry = entry(record, file)?;
        if is_catch_all {
            catch_all_file = Some(entry);
        } else {
            files.push(entry);
        }
    }

    if let Some(path) = catch_all_path {
        if catch_all_file.is_none() {
            return Err(ValidationError::CatchAllMissing {
                path: path.to_string(),
            });
        }
    }

    Ok(Manifest {
        aliases: request.aliases.clone(),
        folders: relative_folders(output_dir, folders),
        catch_all_file,
        global_headers: request.global_headers.clone(),
        files,
    })
}
