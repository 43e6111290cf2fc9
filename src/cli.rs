use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "comproc", about = "A docker-compose-like process manager", version)]
pub struct Cli {
    /// Path to the config file
    #[arg(long = "file", default_value = "comproc.toml", global = true)]
    pub file: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start services and their dependencies
    Up {
        services: Vec<String>,
        /// Follow log output after starting
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop all services and shut down the daemon
    Down,
    /// Stop services (and their dependents) without shutting down
    Stop { services: Vec<String> },
    /// Show service status
    #[command(visible_alias = "ps")]
    Status,
    /// Restart services
    Restart { services: Vec<String> },
    /// Show service logs
    Logs {
        services: Vec<String>,
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
    /// Attach to a service: stream its logs and forward stdin
    Attach { service: String },
    /// Run the daemon process (spawned internally by `up`)
    #[command(name = "__daemon", hide = true)]
    Daemon,
}
