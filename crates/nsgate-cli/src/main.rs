//! nsgate - namespace execution gateway
//!
//! CLI surface for running commands inside a service's network namespace
//! and for verifying that a deployment has converged to its expected
//! state.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nsgate_core::config::DeploymentConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;

/// nsgate - namespace execution gateway
#[derive(Parser, Debug)]
#[command(name = "nsgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to deployment configuration file
    #[arg(short, long, default_value = "/etc/nsgate/deployment.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command inside a service's network namespace
    Exec {
        /// Target namespace
        namespace: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Run the convergence verification scenario
    Verify,

    /// Show a unit's state and recent log lines
    Status {
        /// Unit name
        unit: String,

        /// Number of log lines to show
        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let code = rt.block_on(run(cli))?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = DeploymentConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load '{}'", cli.config.display()))?;

    match cli.command {
        Commands::Exec { namespace, command } => {
            commands::exec::run(&config, &namespace, &command).await
        }
        Commands::Verify => commands::verify::run(&config).await,
        Commands::Status { unit, lines } => commands::status::run(&unit, lines).await,
    }
}
