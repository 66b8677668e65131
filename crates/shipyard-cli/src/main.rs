//! Shipyard CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Build and push container images through a bounded job queue", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "shipyard.kdl")]
        path: PathBuf,
    },
    /// Print the Dockerfile generated for a job file
    Render {
        /// Path to a job file (JSON)
        path: PathBuf,
    },
    /// Build and push the images described by job files
    Run {
        /// Path to the configuration file
        #[arg(long, env = "SHIPYARD_CONFIG")]
        config: Option<PathBuf>,

        /// Use this Postgres database for job records
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// Give up waiting after this long (e.g. "30m") and cancel the rest
        #[arg(long)]
        wait: Option<String>,

        /// Print final records as JSON
        #[arg(long)]
        json: bool,

        /// Job files (JSON)
        #[arg(required = true)]
        jobs: Vec<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Render { path } => {
            commands::render(&path)?;
        }
        Commands::Run {
            config,
            database_url,
            wait,
            json,
            jobs,
        } => {
            commands::run::run(commands::run::RunOptions {
                config,
                database_url,
                wait,
                json,
                jobs,
            })
            .await?;
        }
    }

    Ok(())
}
