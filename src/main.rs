use anyhow::Result;
use clap::{Parser, Subcommand};
use pharos::config::PharosConfig;
use pharos::telemetry::{LogFormat, init_tracing};
use pharos_common::{LoadFailureMode, ThrottlingMethod};
use std::path::PathBuf;
use std::time::Duration;

mod cmd;

#[derive(Parser)]
#[command(name = "pharos")]
#[command(version, about = "Collect page artifacts from a browser over its debugging protocol")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to pharos.toml (defaults to ./pharos.toml)
    #[arg(short, long, global = true, env = "PHAROS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Protocol endpoint as host:port. Overrides pharos.toml and PHAROS_CONNECT.
    #[arg(long, global = true)]
    pub connect: Option<String>,

    /// Throttling method: simulate, devtools, provided
    #[arg(long, global = true)]
    pub throttling_method: Option<ThrottlingMethod>,

    /// What to do when the page fails to load: fatal, warn, ignore
    #[arg(long, global = true)]
    pub load_failure_mode: Option<LoadFailureMode>,

    /// Write the result JSON here instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a URL and collect artifacts from the load
    Navigate { url: String },
    /// Record while the page is used, then collect artifacts
    Timespan {
        /// Seconds to record; waits for Ctrl-C when omitted
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Collect artifacts from the page as it is now
    Snapshot,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a pharos.toml listing every built-in gatherer
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_format, cli.log_dir.as_deref())?;

    let mut config = PharosConfig::new(cli.config.clone())?;
    config.cli_endpoint = cli.connect.clone();
    config.cli_throttling_method = cli.throttling_method;
    config.cli_load_failure_mode = cli.load_failure_mode;
    let output = cli.output.as_deref();

    match &cli.command {
        Commands::Navigate { url } => cmd::cmd_navigate(&config, url, output).await?,
        Commands::Timespan { duration } => {
            cmd::cmd_timespan(&config, duration.map(Duration::from_secs), output).await?
        }
        Commands::Snapshot => cmd::cmd_snapshot(&config, output).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
