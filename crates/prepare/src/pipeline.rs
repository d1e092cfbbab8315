//! Per-file compression and hashing pipeline.
//!
//! Every discovered file is read once. Its chunks are multicast to one
//! [`EncodedFileSink`] per encoding and a [`HashSink`], and the byte count
//! of each output plus the content digest become the file's [`FileRecord`].
//! Files run through a semaphore-bounded pool sized by the [`ConcurrencyPlan`].

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::{EncodedFileSink, EncoderSettings, EncodingKind};
use crate::fanout::{Multicast, PumpError, SinkError, SinkHandle};
use crate::hash::{ContentHash, HashError, HashSink};
use crate::layout::Folders;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// Error type for the per-file pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Opening the source or creating an output failed
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// An encoder or the hasher failed
    #[error("{path}: {source}")]
    Sink {
        path: String,
        #[source]
        source: SinkError,
    },

    /// Reading the source failed
    #[error("{path}: {source}")]
    Source {
        path: String,
        #[source]
        source: PumpError,
    },

    /// The hash accumulator did not produce exactly one digest
    #[error("{path}: {source}")]
    Hash {
        path: String,
        #[source]
        source: HashError,
    },

    /// A worker task panicked
    #[error("File task failed: {0}")]
    Task(#[from] JoinError),

    /// One or more files failed; `first` is the earliest in input order
    #[error("{failed} of {total} files failed to prepare, first error: {first}")]
    Files {
        failed: usize,
        total: usize,
        first: Box<PipelineError>,
    },
}

/// Settings the pipeline runs with
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Only write identity copies and hashes
    pub skip_compression: bool,
    /// Bytes read from the source per chunk
    pub chunk_size: usize,
    /// Chunks each sink may have queued
    pub sink_buffer_chunks: usize,
    pub encoders: EncoderSettings,
}

impl PipelineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            skip_compression: cfg.build.skip_compression,
            chunk_size: cfg.build.chunk_size,
            sink_buffer_chunks: cfg.build.sink_buffer_chunks,
            encoders: EncoderSettings::from(&cfg.compression),
        }
    }

    /// Encodings written for every file
    pub fn kinds(&self) -> &'static [EncodingKind] {
        if self.skip_compression {
            &[EncodingKind::Identity]
        } else {
            &EncodingKind::ALL
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Output size per encoding; `None` when the encoding was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sizes {
    pub identity: u64,
    pub gzip: Option<u64>,
    pub deflate: Option<u64>,
    pub brotli: Option<u64>,
}

impl Sizes {
    fn from_outputs(identity: u64, compressed: &[(EncodingKind, u64)]) -> Self {
        let size_of = |kind| {
            compressed
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, size)| *size)
        };
        Self {
            identity,
            gzip: size_of(EncodingKind::Gzip),
            deflate: size_of(EncodingKind::Deflate),
            brotli: size_of(EncodingKind::Brotli),
        }
    }
}

/// Computed metadata of one prepared file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Path relative to the target directory, prefixed with `/`
    pub path: String,
    pub sizes: Sizes,
    pub hash: ContentHash,
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    path.extend(relative.split('/').filter(|part| !part.is_empty()));
    path
}

fn rooted(relative: &str) -> String {
    format!("/{}", relative.trim_start_matches('/'))
}

async fn open_sink(
    kind: EncodingKind,
    path: PathBuf,
    settings: &EncoderSettings,
) -> io::Result<EncodedFileSink> {
    let settings = settings.clone();
    tokio::task::spawn_blocking(move || EncodedFileSink::create(kind, path, &settings))
        .await
        .map_err(io::Error::other)?
}

/// Waits for a sink, keeping the first error seen.
async fn collect<T>(
    handle: SinkHandle<T>,
    relative: &str,
    first_error: &mut Option<PipelineError>,
) -> Option<T> {
    match handle.wait().await {
        Ok(output) => output,
        Err(source) => {
            first_error.get_or_insert(PipelineError::Sink {
                path: rooted(relative),
                source,
            });
            None
        }
    }
}

/// Prepares a single file: every encoded copy plus its content hash.
///
/// On any failure, every output already written for this file is removed
/// before the error is returned.
pub async fn prepare_file(
    target_dir: &Path,
    relative: &str,
    folders: &Folders,
    options: &PipelineOptions,
) -> Result<FileRecord, PipelineError> {
    let source_path = join_relative(target_dir, relative);
    let source = tokio::fs::File::open(&source_path)
        .await
        .map_err(|source| PipelineError::Io {
            path: rooted(relative),
            source,
        })?;

    let result = stream_file(source, relative, folders, options).await;
    if result.is_err() {
        remove_outputs(folders, relative, options.kinds()).await;
    }
    result
}

async fn stream_file(
    source: tokio::fs::File,
    relative: &str,
    folders: &Folders,
    options: &PipelineOptions,
) -> Result<FileRecord, PipelineError> {
    let mut multicast = Multicast::new(options.chunk_size, options.sink_buffer_chunks);
    let mut writers = Vec::with_capacity(EncodingKind::ALL.len());
    let mut setup_error = None;

    for &kind in options.kinds() {
        let output = folders.output_path(kind, relative);
        match open_sink(kind, output, &options.encoders).await {
            Ok(sink) => writers.push((kind, multicast.attach(sink))),
            Err(source) => {
                setup_error = Some(PipelineError::Io {
                    path: rooted(relative),
                    source,
                });
                break;
            }
        }
    }
    let hasher = multicast.attach(HashSink::new());

    let pumped = match setup_error {
        None => multicast.pump(source).await,
        Some(err) => {
            // Closing the queues without an end frame aborts the attached sinks
            drop(multicast);
            for (_, handle) in writers {
                let _ = handle.wait().await;
            }
            let _ = hasher.wait().await;
            return Err(err);
        }
    };

    let mut first_error = None;
    let mut identity = None;
    let mut compressed = Vec::with_capacity(EncodingKind::COMPRESSED.len());
    for (kind, handle) in writers {
        if let Some(size) = collect(handle, relative, &mut first_error).await {
            match kind {
                EncodingKind::Identity => identity = Some(size),
                _ => compressed.push((kind, size)),
            }
        }
    }
    let digest = collect(hasher, relative, &mut first_error).await;

    // A sink's own error explains a closed queue better than the pump does
    if let Some(err) = first_error {
        return Err(err);
    }
    if let Err(source) = pumped {
        return Err(PipelineError::Source {
            path: rooted(relative),
            source,
        });
    }

    match (identity, digest) {
        (Some(identity), Some(hash)) => Ok(FileRecord {
            path: rooted(relative),
            sizes: Sizes::from_outputs(identity, &compressed),
            hash,
        }),
        _ => Err(PipelineError::Hash {
            path: rooted(relative),
            source: HashError::NotFinalized,
        }),
    }
}

async fn remove_outputs(folders: &Folders, relative: &str, kinds: &[EncodingKind]) {
    for &kind in kinds {
        let path = folders.output_path(kind, relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove output"),
        }
    }
}

/// Runs `task(index)` for every index in `0..count`, at most `permits` at a time.
///
/// Outputs come back in index order; a slot is `None` when its task
/// panicked, and the panic is in the second list.
async fn run_bounded<T, F, Fut>(
    count: usize,
    permits: usize,
    task: F,
) -> (Vec<Option<T>>, Vec<JoinError>)
where
    T: Send + 'static,
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(permits.max(1)));
    let task = Arc::new(task);

    let mut tasks = JoinSet::new();
    for index in 0..count {
        let semaphore = semaphore.clone();
        let task = task.clone();
        tasks.spawn(async move {
            // The semaphore is never closed, so this always holds a permit
            let _permit = semaphore.acquire_owned().await;
            (index, task(index).await)
        });
    }

    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    let mut panics = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, output)) => slots[index] = Some(output),
            Err(join_err) => panics.push(join_err),
        }
    }
    (slots, panics)
}

/// Prepares every file, at most `plan.max_concurrent_files` at a time.
///
/// A failing file does not stop its siblings; once all have finished the
/// call fails if any did. Records are returned in the order of `files`.
pub async fn prepare_output_files(
    target_dir: &Path,
    folders: &Folders,
    files: &[String],
    options: &PipelineOptions,
    plan: &ConcurrencyPlan,
) -> Result<Vec<FileRecord>, PipelineError> {
    let target_dir = Arc::new(target_dir.to_path_buf());
    let folders = Arc::new(folders.clone());
    let options = Arc::new(options.clone());
    let shared_files: Arc<[String]> = files.into();

    let (slots, panics) = run_bounded(files.len(), plan.permits(), move |index| {
        let target_dir = target_dir.clone();
        let folders = folders.clone();
        let options = options.clone();
        let files = shared_files.clone();
        async move {
            let relative = &files[index];
            debug!(file = %relative, "preparing file");
            prepare_file(&target_dir, relative, &folders, &options).await
        }
    })
    .await;

    let mut records = Vec::with_capacity(files.len());
    let mut failures = Vec::new();
    for result in slots.into_iter().flatten() {
        match result {
            Ok(record) => {
                debug!(file = %record.path, hash = %record.hash, "prepared file");
                records.push(record);
            }
            Err(err) => {
                warn!(error = %err, "file failed to prepare");
                failures.push(err);
            }
        }
    }
    failures.extend(panics.into_iter().map(PipelineError::Task));

    if failures.is_empty() {
        return Ok(records);
    }
    let failed = failures.len();
    let first = failures.swap_remove(0);
    Err(PipelineError::Files {
        failed,
        total: files.len(),
        first: Box::new(first),
    })
}
