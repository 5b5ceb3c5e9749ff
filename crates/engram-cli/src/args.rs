use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "engram", version, about = "Second-brain analysis daemon for coding-agent session logs")]
pub struct Cli {
    /// Data directory override (default: ENGRAM_DATA_DIR or the XDG data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    /// Config file override (default: ENGRAM_CONFIG or <data_dir>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the analysis daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Run the preflight checks and print the results
    Health {
        /// Also run the analyzer roundtrip (spends one model call)
        #[arg(long)]
        roundtrip: bool,
    },
    /// Manage the analyzer prompt
    Prompt {
        #[command(subcommand)]
        command: PromptCommand,
    },
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground
    Start,
    /// Signal a running daemon to shut down
    Stop,
    /// Show daemon status (pidfile + HTTP status endpoint)
    Status,
}

#[derive(Subcommand)]
pub enum PromptCommand {
    /// Force a prompt version bump by appending a marker line
    Bump {
        /// Why the bump is needed; recorded in the marker
        #[arg(long)]
        reason: String,
    },
}
