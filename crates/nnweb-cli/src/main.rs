//! CLI for loading models through the nnweb backend dispatcher.

mod commands;
mod fetch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{Globals, config, crash, probe, run};

/// nnweb - Run neural-network graphs on the best available backend
#[derive(Parser)]
#[command(name = "nnweb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the GPU crash state file
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report which backends this environment supports
    Probe(probe::ProbeArgs),

    /// Load a model directory and run it once
    Run(run::RunArgs),

    /// Inspect or clear the persisted GPU crash state
    Crash(crash::CrashArgs),

    /// Manage configuration
    Config(config::ConfigArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let globals = Globals {
        config: cli.config,
        state_file: cli.state_file,
    };

    match cli.command {
        Commands::Probe(args) => probe::run(args, &globals),
        Commands::Run(args) => run::run(args, &globals).await,
        Commands::Crash(args) => crash::run(args, &globals),
        Commands::Config(args) => config::run(args, &globals),
    }
}
