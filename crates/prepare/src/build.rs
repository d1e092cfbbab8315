//! Build orchestration
//!
//! Wires request validation, discovery, the output layout, the per-file
//! pipeline and manifest assembly into a single build, and owns the output
//! directory lifecycle.

use crate::concurrency::derive_plan;
use crate::config::{Config, ConfigError};
use crate::discover::{discover, DiscoverError};
use crate::layout::{build_layout, create_file_folders, LayoutError};
use crate::manifest::{assemble, Manifest};
use crate::pipeline::{prepare_output_files, PipelineError, PipelineOptions};
use crate::request::{parse_request, ValidationError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Name of the manifest written into the output directory
pub const MANIFEST_FILE_NAME: &str = "setup.json";

/// Error type for a whole build
#[derive(Debug, Error)]
pub enum BuildError {
    /// The request is malformed or disagrees with the source tree
    #[error("Invalid build request: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listing the target directory failed
    #[error(transparent)]
    Discover(#[from] DiscoverError),

    /// Creating the output layout failed
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// At least one file could not be prepared
    #[error("Failed to prepare files: {0}")]
    Pipeline(#[from] PipelineError),

    /// Build-scoped filesystem failure
    #[error("Failed {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The manifest could not be serialized
    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Clearing the output directory would delete the sources
    #[error("Output `{}` must not contain target `{}`", output.display(), target.display())]
    OutputContainsTarget { output: PathBuf, target: PathBuf },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> BuildError {
    let context = context.into();
    move |source| BuildError::Io { context, source }
}

/// Inputs of a single build
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// JSON build request
    pub request_path: PathBuf,
    /// Source tree
    pub target_dir: PathBuf,
    /// Destination directory, recreated on every build
    pub output_dir: PathBuf,
    /// Only write identity copies and hashes; ORed with the config toggle
    pub skip_compression: bool,
}

/// Rejects an output directory that is, or lies above, the target.
async fn check_output_location(target_dir: &Path, output_dir: &Path) -> Result<(), BuildError> {
    let target = tokio::fs::canonicalize(target_dir)
        .await
        .map_err(|_| DiscoverError::NotADirectory(target_dir.to_path_buf()))?;
    // A missing output directory cannot contain anything
    let Ok(output) = tokio::fs::canonicalize(output_dir).await else {
        return Ok(());
    };
    if target.starts_with(&output) {
        return Err(BuildError::OutputContainsTarget { output, target });
    }
    Ok(())
}

async fn clear_output(output_dir: &Path) -> Result<(), BuildError> {
    match tokio::fs::remove_dir_all(output_dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(format!("to clear output {}", output_dir.display()))(err)),
    }
}

/// Runs a build and returns the manifest without writing it.
///
/// The request is validated before the filesystem is touched. The output
/// directory is removed and rebuilt from scratch.
pub async fn prepare_server_setup(
    options: &BuildOptions,
    config: &Config,
) -> Result<Manifest, BuildError> {
    // Step 1: Read and validate the request
    let text = tokio::fs::read_to_string(&options.request_path)
        .await
        .map_err(io_error(format!(
            "to read request {}",
            options.request_path.display()
        )))?;
    let request = parse_request(&text)?;

    // Step 2: Check the target and where the output goes
    check_output_location(&options.target_dir, &options.output_dir).await?;

    // Step 3: Start from an empty output directory
    clear_output(&options.output_dir).await?;

    // Step 4: Discover files
    let target = options.target_dir.clone();
    let mut files = tokio::task::spawn_blocking(move || discover(&target))
        .await
        .map_err(|err| io_error("to discover files")(io::Error::other(err)))??;
    files.sort();
    info!(count = files.len(), target = %options.target_dir.display(), "discovered files");

    // Step 5: Create encoding roots and every folder a file lands in
    let folders = build_layout(&options.output_dir).await?;
    create_file_folders(&folders, &files).await?;

    // Step 6: Prepare every file under the derived concurrency bound
    let mut pipeline = PipelineOptions::from_config(config);
    pipeline.skip_compression |= options.skip_compression;
    let plan = derive_plan(config, files.len());
    info!(
        max_concurrent_files = plan.max_concurrent_files,
        skip_compression = pipeline.skip_compression,
        "preparing files"
    );
    let records =
        prepare_output_files(&options.target_dir, &folders, &files, &pipeline, &plan).await?;

    // Step 7: Merge records with the request
    Ok(assemble(&request, &folders, &options.output_dir, records)?)
}

/// Writes `manifest` to `output_dir/setup.json` through a temporary file.
pub async fn write_manifest(output_dir: &Path, manifest: &Manifest) -> Result<PathBuf, BuildError> {
    let json = serde_json::to_vec_pretty(manifest)?;
    let path = output_dir.join(MANIFEST_FILE_NAME);
    let temp = output_dir.join(format!(".{MANIFEST_FILE_NAME}.tmp"));

    tokio::fs::write(&temp, &json)
        .await
        .map_err(io_error(format!("to write {}", temp.display())))?;
    if let Err(err) = tokio::fs::rename(&temp, &path).await {
        match tokio::fs::remove_file(&temp).await {
            Ok(()) => {}
            Err(clean_err) if clean_err.kind() == io::ErrorKind::NotFound => {}
            Err(clean_err) => warn!(
                path = %temp.display(),
                error = %clean_err,
                "failed to remove temporary manifest"
            ),
        }
        return Err(io_error(format!("to write {}", path.display()))(err));
    }
    Ok(path)
}

/// Runs a build and writes its manifest.
///
/// Returns the confirmation message. Nothing is written to the manifest
/// location if any step fails.
pub async fn build(options: &BuildOptions, config: &Config) -> Result<String, BuildError> {
    let manifest = prepare_server_setup(options, config).await?;
    let path = write_manifest(&options.output_dir, &manifest).await?;
    info!(
        manifest = %path.display(),
        files = manifest.files.len(),
        catch_all = manifest.catch_all_file.is_some(),
        "build finished"
    );
    Ok(format!(
        "Finished preparing output in {}",
        options.output_dir.display()
    ))
}
