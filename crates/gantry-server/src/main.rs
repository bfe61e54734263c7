//! Gantry server entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::Commands;
use config::{LogFormat, ServerConfig};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Gantry job orchestration server", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;
    init_logging(config.log_format);

    match cli.command {
        Commands::Serve => handlers::serve(&config).await?,
        Commands::Migrate => handlers::migrate(&config).await?,
        Commands::Reconcile { run_id } => handlers::reconcile(&config, run_id).await?,
        Commands::Dispatch(args) => handlers::dispatch(&config, args).await?,
        Commands::Cancel { run_id } => handlers::cancel(&config, run_id).await?,
        Commands::Rerun { run_id, job } => handlers::rerun(&config, run_id, job).await?,
    }

    Ok(())
}

fn init_logging(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,gantry=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
