//! Job Runtime - Entry Point
//!
//! Runs one job command with the selected runtime and exits with the job
//! exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::Result;
use tracing::{Level, debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use job_runtime::job::{DEFAULT_IMAGE, Job, JobConfig};
use job_runtime::runtime::RuntimeKind;

/// Run a test job inside a container runtime.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime to run the job with (docker, podman, null)
    #[arg(long, default_value_t = RuntimeKind::Podman)]
    runtime: RuntimeKind,

    /// Container image
    #[arg(long, default_value = DEFAULT_IMAGE)]
    image: String,

    /// Artifact URL; file:// artifacts are bound read-only into the container
    #[arg(long = "asset", value_name = "URL")]
    assets: Vec<String>,

    /// Write the job log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the recorded results as JSON to this file
    #[arg(long)]
    results: Option<PathBuf>,

    /// Open a terminal when the job announces a hacking session
    #[arg(long, default_value = "false")]
    hacking_session: bool,

    /// Let the job start its own containers through the host runtime
    #[arg(long, default_value = "false")]
    docker_proxy: bool,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    debug: bool,

    /// Command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // The job log may go to stderr too; keep our own messages terse.
    let filter = if args.debug {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Job Runtime v{}", env!("CARGO_PKG_VERSION"));
    debug!(?args, "Arguments");

    let mut config = JobConfig::new(args.command)
        .with_runtime(args.runtime)
        .with_image(args.image)
        .with_docker_proxy(args.docker_proxy)
        .with_hacking_session(args.hacking_session);
    config.assets = args.assets;
    if let Some(path) = args.log_file {
        config = config.with_log_file(path);
    }
    if let Some(path) = args.results {
        config = config.with_results_file(path);
    }

    let outcome = Job::new(config).run()?;
    Ok(ExitCode::from(
        u8::try_from(outcome.exit_code.clamp(0, 255)).unwrap_or(u8::MAX),
    ))
}
