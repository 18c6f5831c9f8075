// cirun
// Run Azure-style CI matrix job templates locally

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Run Azure Pipelines matrix jobs on this machine
#[derive(Parser, Debug)]
#[command(name = "cirun", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load, expand and run a pipeline
    Run(commands::run::RunArgs),
    /// Check that a pipeline loads and its matrices expand
    Validate(commands::validate::ValidateArgs),
    /// List the job instances a pipeline expands to
    Matrix(commands::matrix::MatrixArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Matrix(args) => commands::matrix::execute(args),
    }
}

/// `CIRUN_LOG` wins over `RUST_LOG`; without either, `-v` picks the level
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_env("CIRUN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
