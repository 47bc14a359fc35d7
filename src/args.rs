use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "devrun")]
#[command(version)]
#[command(about = "Run every service of a multi-service project locally", long_about = None)]
pub(crate) struct Cli {
    /// Verbose logging (same as DEVRUN_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start all services and supervise them until interrupted
    Run(RunArgs),

    /// Show how each service would be launched, without starting anything
    Services {
        #[command(flatten)]
        source: ManifestArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct ManifestArgs {
    /// Manifest file (default: $DEVRUN_MANIFEST or ./devrun.toml)
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// Env file whose variables are layered over the inherited environment
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Only these services (repeatable)
    #[arg(short, long = "service")]
    pub services: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct RunArgs {
    #[command(flatten)]
    pub source: ManifestArgs,

    /// Dashboard API port (default: 4280)
    #[arg(long)]
    pub dashboard_port: Option<u16>,

    /// Do not start the dashboard API
    #[arg(long)]
    pub no_dashboard: bool,

    /// Milliseconds between interrupt and force kill on stop
    #[arg(long)]
    pub grace_period_ms: Option<u64>,
}
