//! The coordinator binary.

#[macro_use]
extern crate log;

use cirrus::coordinator::{Assignment, Coordinator, CoordinatorConfig, CoordinatorTimers};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Treelet assignment mode, as named on the command line.
#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum AssignmentArg {
    Static,
    Uniform,
}

#[derive(Parser)]
#[command(author, version, about = "Coordinator for the cirrus distributed path tracer")]
struct Options {
    /// Path to the scene dump.
    #[arg(long = "scene-path", short = 's', value_name = "PATH")]
    scene_path: PathBuf,

    /// Port to listen on.
    #[arg(long, short = 'p', value_name = "PORT", default_value_t = 50_000)]
    port: u16,

    /// Public IP of this machine.
    #[arg(long, short = 'i', value_name = "IPSTRING")]
    ip: String,

    /// Region to run workers in.
    #[arg(long = "aws-region", short = 'r', value_name = "REGION", default_value = "us-west-2")]
    aws_region: String,

    /// Storage backend URI.
    #[arg(long = "storage-backend", short = 'b', value_name = "URI")]
    storage_backend: String,

    /// How many workers to launch.
    #[arg(long, short = 'l', value_name = "N")]
    lambdas: u32,

    /// Treelet assignment mode.
    #[arg(long, short = 'a', value_enum, default_value_t = AssignmentArg::Uniform)]
    assignment: AssignmentArg,

    /// Show treelet use stats.
    #[arg(long = "treelet-stats", short = 't')]
    treelet_stats: bool,

    /// Show worker use stats.
    #[arg(long = "worker-stats", short = 'w')]
    worker_stats: bool,

    /// Collect and display worker diagnostics on exit.
    #[arg(long, short = 'd')]
    diagnostics: bool,

    /// Eagerly build a complete topology.
    #[arg(long, short = 'k')]
    complete: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();

    let options = Options::parse();
    let config = CoordinatorConfig {
        scene_path: options.scene_path,
        listen_port: options.port,
        public_address: format!("{}:{}", options.ip, options.port),
        storage_uri: options.storage_backend,
        aws_region: options.aws_region,
        num_workers: options.lambdas,
        assignment: match options.assignment {
            AssignmentArg::Static => Assignment::Static,
            AssignmentArg::Uniform => Assignment::Uniform,
        },
        treelet_stats: options.treelet_stats,
        worker_stats: options.worker_stats,
        collect_diagnostics: options.diagnostics,
        complete_topology: options.complete,
        launch_workers: true,
        timers: CoordinatorTimers::default(),
    };

    let mut coordinator = match Coordinator::bind(config).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = coordinator.run().await {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
