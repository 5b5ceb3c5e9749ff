use anyhow::{Context, Result};
use std::path::PathBuf;

use engram_runtime::{Config, resolve_data_dir};

use crate::args::{Cli, Commands, DaemonCommand, PromptCommand};
use crate::handlers;

pub(crate) struct CliContext {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub config: Config,
}

pub fn run(cli: Cli) -> Result<()> {
    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Config::default_path(&data_dir));
    let config = Config::load_from(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let ctx = CliContext {
        data_dir,
        config_path,
        config,
    };

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommand::Start => handlers::daemon::start(ctx),
            DaemonCommand::Stop => handlers::daemon::stop(ctx),
            DaemonCommand::Status => handlers::daemon::status(ctx),
        },
        Commands::Health { roundtrip } => handlers::health::run(ctx, roundtrip),
        Commands::Prompt { command } => match command {
            PromptCommand::Bump { reason } => handlers::prompt::bump(ctx, &reason),
        },
    }
}
