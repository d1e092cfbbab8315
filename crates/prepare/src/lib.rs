//! serve-prepare
//!
//! Precompiles a static file tree into identity, gzip, deflate and brotli
//! copies plus a `setup.json` manifest describing every file.

pub mod build;
pub mod concurrency;
pub mod discover;
pub mod encode;
pub mod fanout;
pub mod hash;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod request;

pub use serve_prepare_config as config;
pub use serve_prepare_config::Config;
pub use build::{build, prepare_server_setup, write_manifest, BuildError, BuildOptions, MANIFEST_FILE_NAME};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use discover::{discover, DiscoverError};
pub use encode::{EncodedFileSink, EncoderSettings, EncodingKind};
pub use fanout::{ChunkSink, Frame, Multicast, PumpError, SinkError, SinkHandle};
pub use hash::{ContentHash, HashError, HashSink};
pub use layout::{build_layout, create_file_folders, leaf_folders, Folders, LayoutError};
pub use manifest::{assemble, Manifest, ManifestEntry, ManifestFolders};
pub use pipeline::{
    prepare_file, prepare_output_files, FileRecord, PipelineError, PipelineOptions, Sizes,
};
pub use request::{
    parse_request, validate, Alias, BuildRequest, FileOverride, Headers, ValidationError,
};
