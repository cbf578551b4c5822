mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// turnstream - reconcile recorded agent envelope streams into a transcript
#[derive(Parser, Debug)]
#[command(version = turnstream::build_info::VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a recorded envelope stream through the engine and print the result
    Replay {
        /// JSONL file with one envelope per line
        #[arg(short, long)]
        script: PathBuf,

        /// Path to configuration file
        #[arg(short, long, default_value = "turnstream.yaml")]
        config: String,

        /// Chat to replay into (defaults to the first envelope's chat)
        #[arg(long)]
        chat: Option<String>,

        /// Resume this existing assistant message instead of starting a turn
        #[arg(long)]
        message: Option<String>,

        /// Resume cursor; only used with --message
        #[arg(long, requires = "message")]
        after_seq: Option<u64>,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Load, validate and print the effective configuration
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "turnstream.yaml")]
        config: String,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            script,
            config,
            chat,
            message,
            after_seq,
            format,
        } => {
            let opts = commands::replay::ReplayOptions {
                script,
                config,
                chat,
                message,
                after_seq,
                format: format.parse()?,
            };
            commands::replay::run(opts).await
        }
        Commands::CheckConfig { config, format } => {
            commands::check_config::run(&config, format.parse()?).await
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
