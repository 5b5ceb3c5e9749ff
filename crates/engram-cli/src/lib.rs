mod args;
mod commands;
mod handlers;

pub use args::{Cli, Commands, DaemonCommand, PromptCommand};
pub use commands::run;
