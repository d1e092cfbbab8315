//! Content hashing of source files.

use crate::fanout::{ChunkSink, SinkError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Violations of the one-digest-per-file invariant. These indicate a
/// programming defect and are never recovered from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("hash accumulator finalized more than once")]
    AlreadyFinalized,

    #[error("hash accumulator received data after it was finalized")]
    UpdateAfterFinalize,

    #[error("hash accumulator was never finalized")]
    NotFinalized,
}

/// Lowercase hex SHA-256 digest of a file's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of the hex rendering.
    pub const HEX_LEN: usize = 64;

    /// Hashes an in-memory buffer.
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Streaming SHA-256 accumulator that yields exactly one digest.
pub struct HashSink {
    hasher: Option<Sha256>,
}

impl Default for HashSink {
    fn default() -> Self {
        Self::new()
    }
}

impl HashSink {
    pub fn new() -> Self {
        Self {
            hasher: Some(Sha256::new()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) -> Result<(), HashError> {
        match self.hasher.as_mut() {
            Some(hasher) => {
                hasher.update(chunk);
                Ok(())
            }
            None => Err(HashError::UpdateAfterFinalize),
        }
    }

    /// Produces the digest. A second call is a [`HashError::AlreadyFinalized`].
    pub fn finalize(&mut self) -> Result<ContentHash, HashError> {
        let hasher = self.hasher.take().ok_or(HashError::AlreadyFinalized)?;
        Ok(ContentHash(format!("{:x}", hasher.finalize())))
    }
}

impl ChunkSink for HashSink {
    type Output = ContentHash;

    fn accept(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.update(chunk)?;
        Ok(())
    }

    fn finish(mut self) -> Result<ContentHash, SinkError> {
        Ok(self.finalize()?)
    }

    fn abort(self) {}
}
