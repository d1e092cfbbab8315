//! Streaming writers for the identity, gzip, deflate and brotli copies.
//!
//! Each copy is produced by an encoder writing into a [`CountingWriter`]
//! that sits in front of the output file, so the recorded size is exactly
//! the number of bytes handed to the file.

use super::EncodingKind;
use crate::fanout::{ChunkSink, SinkError};
use brotli::CompressorWriter;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serve_prepare_config::CompressionConfig;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Buffer used by the brotli encoder between compression rounds.
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Encoder tuning, already clamped to valid ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub gzip_level: u32,
    pub deflate_level: u32,
    pub brotli_quality: u32,
    pub brotli_window: u32,
}

impl From<&CompressionConfig> for EncoderSettings {
    fn from(cfg: &CompressionConfig) -> Self {
        let cfg = cfg.clamped();
        Self {
            gzip_level: cfg.gzip_level,
            deflate_level: cfg.deflate_level,
            brotli_quality: cfg.brotli_quality,
            brotli_window: cfg.brotli_window,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from(&CompressionConfig::default())
    }
}

/// Counts bytes passed through to `inner` and remembers the first write failure.
///
/// Some encoders (brotli) swallow errors raised while finishing the stream;
/// the remembered failure lets the caller still notice them.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
    failure: Option<io::Error>,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            count: 0,
            failure: None,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.count
    }

    /// Returns the inner writer, or the first write failure seen.
    pub fn into_inner(self) -> io::Result<W> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.inner),
        }
    }

    fn remember(&mut self, err: &io::Error) {
        if self.failure.is_none() && err.kind() != io::ErrorKind::Interrupted {
            self.failure = Some(io::Error::new(err.kind(), err.to_string()));
        }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => {
                self.count += n as u64;
                Ok(n)
            }
            Err(err) => {
                self.remember(&err);
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|err| {
            self.remember(&err);
            err
        })
    }
}

type FileOutput = CountingWriter<BufWriter<File>>;

enum Encoder {
    Identity(FileOutput),
    Gzip(GzEncoder<FileOutput>),
    Deflate(ZlibEncoder<FileOutput>),
    Brotli(Box<CompressorWriter<FileOutput>>),
}

impl Encoder {
    fn new(kind: EncodingKind, output: FileOutput, settings: &EncoderSettings) -> Self {
        match kind {
            EncodingKind::Identity => Encoder::Identity(output),
            EncodingKind::Gzip => {
                Encoder::Gzip(GzEncoder::new(output, Compression::new(settings.gzip_level)))
            }
            // HTTP "deflate" is the zlib-wrapped stream
            EncodingKind::Deflate => {
                Encoder::Deflate(ZlibEncoder::new(output, Compression::new(settings.deflate_level)))
            }
            EncodingKind::Brotli => Encoder::Brotli(Box::new(CompressorWriter::new(
                output,
                BROTLI_BUFFER_SIZE,
                settings.brotli_quality,
                settings.brotli_window,
            ))),
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Encoder::Identity(w) => w as &mut dyn Write,
            Encoder::Gzip(w) => w as &mut dyn Write,
            Encoder::Deflate(w) => w as &mut dyn Write,
            Encoder::Brotli(w) => &mut **w as &mut dyn Write,
        }
    }

    /// Writes the stream trailer and hands back the counted file output.
    fn finish(self) -> io::Result<FileOutput> {
        match self {
            Encoder::Identity(w) => Ok(w),
            Encoder::Gzip(w) => w.finish(),
            Encoder::Deflate(w) => w.finish(),
            Encoder::Brotli(w) => Ok(w.into_inner()),
        }
    }
}

/// Sink writing one encoded copy of the source to `path`.
///
/// On failure or abort the partially written file is removed.
pub struct EncodedFileSink {
    kind: EncodingKind,
    path: PathBuf,
    encoder: Encoder,
}

impl EncodedFileSink {
    /// Creates (truncating) the output file for `kind`.
    pub fn create(kind: EncodingKind, path: PathBuf, settings: &EncoderSettings) -> io::Result<Self> {
        let file = File::create(&path)?;
        let output = CountingWriter::new(BufWriter::new(file));
        Ok(Self {
            kind,
            encoder: Encoder::new(kind, output, settings),
            path,
        })
    }

    fn complete(encoder: Encoder) -> io::Result<u64> {
        let output = encoder.finish()?;
        let count = output.bytes_written();
        let mut file = output.into_inner()?;
        file.flush()?;
        Ok(count)
    }
}

impl ChunkSink for EncodedFileSink {
    type Output = u64;

    fn accept(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.encoder.writer().write_all(chunk)?;
        Ok(())
    }

    fn finish(self) -> Result<u64, SinkError> {
        let Self { kind, path, encoder } = self;
        match Self::complete(encoder) {
            Ok(count) => Ok(count),
            Err(err) => {
                discard(kind, &path);
                Err(err.into())
            }
        }
    }

    fn abort(self) {
        let Self { kind, path, encoder } = self;
        // Drop first so nothing is flushed into the file after it is unlinked
        drop(encoder);
        discard(kind, &path);
    }
}

/// Removes a partial output file; a missing file is fine.
fn discard(kind: EncodingKind, path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            encoding = %kind,
            path = %path.display(),
            error = %err,
            "failed to remove partial output"
        ),
    }
}
