//! ServiceDeck CLI - Launch developer services and resolve port conflicts
//!
//! A command-line front end for the ServiceDeck engine: starts services,
//! streams their status and output, and frees occupied ports.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::Context;

#[derive(Parser)]
#[command(name = "servicedeck")]
#[command(author, version, about = "Launch developer services and resolve port conflicts")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Use this configuration file instead of ~/.servicedeck/config.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a command and stream its events until it exits
    Run {
        /// Command line to run through the shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Working directory (defaults to the current directory)
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Port the service needs; repeatable
        #[arg(short, long = "port", value_name = "PORT")]
        ports: Vec<u16>,

        /// Terminate processes holding the service's ports, then retry
        #[arg(short, long)]
        kill_conflicts: bool,
    },

    /// Start a configured project and stream its events
    Project {
        /// Project identifier
        id: String,

        /// Terminate processes holding the project's ports, then retry
        #[arg(short, long)]
        kill_conflicts: bool,
    },

    /// List configured projects
    Projects,

    /// Show which processes listen on the given ports
    Check {
        #[arg(required = true)]
        ports: Vec<u16>,
    },

    /// Terminate the processes listening on the given ports
    Kill {
        #[arg(required = true)]
        ports: Vec<u16>,
    },

    /// List all listening ports
    #[command(alias = "ls")]
    Ports,

    /// Show current configuration
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let ctx = Context::new(cli.json, cli.config)?;

    match cli.command {
        Commands::Run {
            command,
            cwd,
            ports,
            kill_conflicts,
        } => commands::run::service(&ctx, command.join(" "), cwd, ports, kill_conflicts).await?,
        Commands::Project { id, kill_conflicts } => {
            commands::run::project(&ctx, &id, kill_conflicts).await?
        }
        Commands::Projects => commands::config::projects(&ctx).await?,
        Commands::Check { ports } => commands::ports::check(&ctx, &ports).await?,
        Commands::Kill { ports } => commands::ports::kill(&ctx, &ports).await?,
        Commands::Ports => commands::ports::list(&ctx).await?,
        Commands::Config { init } => {
            if init {
                commands::config::init(&ctx).await?;
            } else {
                commands::config::show(&ctx).await?;
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_env("SERVICEDECK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
