use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, LogFormat};
use crate::config::validate_config;

mod cli;
mod commands;
mod config;
mod pidfile;
mod signals;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.config.log_format);
    let settings = validate_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run(settings).await,
        Commands::Backup { force } => commands::backup(settings, force).await,
        Commands::Update { force } => commands::update(settings, force).await,
        Commands::ListBackups { json } => commands::list_backups(settings, json).await,
    }
}
