//! Encoders that write one encoded copy of a source file.

pub mod writer;

pub use writer::{CountingWriter, EncodedFileSink, EncoderSettings};

use serde::Serialize;
use std::fmt;

/// One of the encodings every prepared file can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl EncodingKind {
    /// All kinds, in manifest order.
    pub const ALL: [EncodingKind; 4] = [
        EncodingKind::Identity,
        EncodingKind::Gzip,
        EncodingKind::Deflate,
        EncodingKind::Brotli,
    ];

    /// Kinds that actually compress.
    pub const COMPRESSED: [EncodingKind; 3] = [
        EncodingKind::Gzip,
        EncodingKind::Deflate,
        EncodingKind::Brotli,
    ];

    /// Directory name of this encoding's root below the output directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            EncodingKind::Identity => "files",
            EncodingKind::Gzip => "gzip",
            EncodingKind::Deflate => "deflate",
            EncodingKind::Brotli => "brotli",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EncodingKind::Identity => "identity",
            EncodingKind::Gzip => "gzip",
            EncodingKind::Deflate => "deflate",
            EncodingKind::Brotli => "brotli",
        }
    }
}

impl fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
