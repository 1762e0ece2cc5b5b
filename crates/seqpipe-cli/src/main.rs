mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "seqpipe",
    version,
    about = "Resumable step engine for sequencing pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job, resuming from its checkpoints if present
    Run {
        /// Path to job YAML file
        job: PathBuf,
    },
    /// Validate job configuration, step lists and status backend
    Check {
        /// Path to job YAML file
        job: PathBuf,
    },
    /// List registered step providers by capability
    Steps {
        /// Job YAML whose tool definitions to include
        job: Option<PathBuf>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a job's checkpoints so the next run starts from scratch
    Reset {
        /// Path to job YAML file
        job: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level)?;

    match cli.command {
        Commands::Run { job } => commands::run::execute(&job).await,
        Commands::Check { job } => commands::check::execute(&job),
        Commands::Steps { job, json } => commands::steps::execute(job.as_deref(), json),
        Commands::Reset { job } => commands::reset::execute(&job),
    }
}
