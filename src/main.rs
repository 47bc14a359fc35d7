mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use devrun::clienv;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => commands::run::cmd_run(args).await?,
        Commands::Services { source } => commands::services::cmd_services(source)?,
        Commands::Completions { shell } => commands::completions::cmd_completions(shell),
    }

    Ok(())
}

/// Logs go to stderr; stdout carries service output.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = clienv::log_filter()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
