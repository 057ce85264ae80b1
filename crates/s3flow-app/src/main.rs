//! `s3flow` binary entry point: parses CLI arguments, loads and validates
//! configuration, wires up the ingestion pipeline, and runs it until a
//! shutdown signal arrives.

mod config;
mod logging;
mod wiring;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Watches object-storage buckets, assembles product records, and pushes
/// creation/removal events to downstream consumers.
#[derive(Debug, clap::Parser)]
#[command(name = "s3flow", disable_version_flag = true)]
struct Args {
    /// Path to the YAML configuration document. Required unless `--version`
    /// or `--dump-config` is given.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Load and validate the configuration, print the resolved settings,
    /// and exit without starting the pipeline.
    #[arg(short = 'd', long = "dump-config")]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        println!("s3flow {VERSION}");
        return ExitCode::SUCCESS;
    }

    let Some(config_path) = args.config.as_ref() else {
        if args.dump_config {
            // No file to resolve and dump yet; print a sample document
            // instead, the same role the original's embedded
            // sample-config.yml plays on usage error.
            print!("{}", config::SAMPLE_CONFIG);
            return ExitCode::SUCCESS;
        }
        eprintln!("error: --config <FILE> is required (or pass --version / --dump-config)");
        return ExitCode::FAILURE;
    };

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if args.dump_config {
        println!("{config:#?}");
        return ExitCode::SUCCESS;
    }

    logging::init(&config.log);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal startup error: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), wiring::StartupError> {
    let app = wiring::App::build(&config).await?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(err) => error!("failed to listen for shutdown signal: {}", err),
    }

    app.shutdown(SHUTDOWN_TIMEOUT).await;
    Ok(())
}
