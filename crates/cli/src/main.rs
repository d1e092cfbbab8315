//! CLI entry point for serve-prepare
//!
//! Parses command line arguments, loads configuration and runs a build.

use clap::{Parser, Subcommand};
use serve_prepare::{build, BuildError, BuildOptions, Config};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// serve-prepare - Precompress a static site and describe it in setup.json
#[derive(Parser, Debug)]
#[command(name = "serve-prepare")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare the output directory and write its manifest
    Build {
        /// Path to the JSON build request
        #[arg(long)]
        request: PathBuf,

        /// Directory holding the files to serve
        #[arg(long)]
        target: PathBuf,

        /// Directory to (re)create with the prepared files
        #[arg(long)]
        output: PathBuf,

        /// Only copy files and hash them, without compressing
        #[arg(long, default_value = "false")]
        skip_compression: bool,

        /// Optional configuration file (config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the config file if one was given, else defaults plus environment overrides
fn load_config(path: Option<&Path>) -> Result<Config, BuildError> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None => Ok(Config::from_env()),
    }
}

async fn run(command: Command) -> Result<String, BuildError> {
    match command {
        Command::Build {
            request,
            target,
            output,
            skip_compression,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let options = BuildOptions {
                request_path: request,
                target_dir: target,
                output_dir: output,
                skip_compression,
            };
            build(&options, &config).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    match run(args.command).await {
        Ok(message) => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Build failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
