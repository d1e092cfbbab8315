//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Build-pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildConfig {
    /// Only write identity copies and hashes (default false)
    #[serde(default)]
    pub skip_compression: bool,
    /// Files prepared at the same time (0 = derive from cores and tree size)
    #[serde(default)]
    pub max_concurrent_files: u32,
    /// Bytes read from a source file per chunk (default 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks a single sink may have queued before the source pauses (default 4)
    #[serde(default = "default_sink_buffer_chunks")]
    pub sink_buffer_chunks: usize,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_sink_buffer_chunks() -> usize {
    4
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            skip_compression: false,
            max_concurrent_files: 0,
            chunk_size: default_chunk_size(),
            sink_buffer_chunks: default_sink_buffer_chunks(),
        }
    }
}

/// Encoder tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    /// gzip level, 0-9 (default 6)
    #[serde(default = "default_flate_level")]
    pub gzip_level: u32,
    /// deflate (zlib) level, 0-9 (default 6)
    #[serde(default = "default_flate_level")]
    pub deflate_level: u32,
    /// brotli quality, 0-11 (default 11)
    #[serde(default = "default_brotli_quality")]
    pub brotli_quality: u32,
    /// brotli window size as log2, 10-24 (default 22)
    #[serde(default = "default_brotli_window")]
    pub brotli_window: u32,
}

fn default_flate_level() -> u32 {
    6
}

fn default_brotli_quality() -> u32 {
    11
}

fn default_brotli_window() -> u32 {
    22
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            gzip_level: default_flate_level(),
            deflate_level: default_flate_level(),
            brotli_quality: default_brotli_quality(),
            brotli_window: default_brotli_window(),
        }
    }
}

impl CompressionConfig {
    /// Returns a copy with every setting clamped to the range its encoder accepts
    pub fn clamped(&self) -> Self {
        Self {
            gzip_level: self.gzip_level.min(9),
            deflate_level: self.deflate_level.min(9),
            brotli_quality: self.brotli_quality.min(11),
            brotli_window: self.brotli_window.clamp(10, 24),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

/// Parses a boolean toggle the way the environment overrides accept them
fn parse_toggle(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SERVE_SKIP_COMPRESSION -> build.skip_compression
    /// - SERVE_PREPARE_MAX_CONCURRENT_FILES -> build.max_concurrent_files
    /// - SERVE_PREPARE_CHUNK_SIZE -> build.chunk_size
    /// - SERVE_PREPARE_SINK_BUFFER_CHUNKS -> build.sink_buffer_chunks
    /// - SERVE_PREPARE_GZIP_LEVEL -> compression.gzip_level
    /// - SERVE_PREPARE_DEFLATE_LEVEL -> compression.deflate_level
    /// - SERVE_PREPARE_BROTLI_QUALITY -> compression.brotli_quality
    /// - SERVE_PREPARE_BROTLI_WINDOW -> compression.brotli_window
    ///
    /// Unparseable values are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Some(skip) = env::var("SERVE_SKIP_COMPRESSION")
            .ok()
            .and_then(|val| parse_toggle(&val))
        {
            self.build.skip_compression = skip;
        }

        if let Some(files) = env_parse::<u32>("SERVE_PREPARE_MAX_CONCURRENT_FILES") {
            self.build.max_concurrent_files = files;
        }

        // Zero-sized chunks or queues would stall the pipeline
        if let Some(size) = env_parse::<usize>("SERVE_PREPARE_CHUNK_SIZE").filter(|s| *s > 0) {
            self.build.chunk_size = size;
        }
        if let Some(chunks) =
            env_parse::<usize>("SERVE_PREPARE_SINK_BUFFER_CHUNKS").filter(|c| *c > 0)
        {
            self.build.sink_buffer_chunks = chunks;
        }

        if let Some(level) = env_parse::<u32>("SERVE_PREPARE_GZIP_LEVEL") {
            self.compression.gzip_level = level;
        }
        if let Some(level) = env_parse::<u32>("SERVE_PREPARE_DEFLATE_LEVEL") {
            self.compression.deflate_level = level;
        }
        if let Some(quality) = env_parse::<u32>("SERVE_PREPARE_BROTLI_QUALITY") {
            self.compression.brotli_quality = quality;
        }
        if let Some(window) = env_parse::<u32>("SERVE_PREPARE_BROTLI_WINDOW") {
            self.compression.brotli_window = window;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
