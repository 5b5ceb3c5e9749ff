use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};

use engram_analyzer::append_version_bump;
use engram_index::Database;
use engram_runtime::resolve_prompt_version;

use crate::commands::CliContext;

pub fn bump(ctx: CliContext, reason: &str) -> Result<()> {
    let prompt_path = ctx.config.prompt_path(&ctx.data_dir);
    if !prompt_path.exists() {
        anyhow::bail!(
            "no prompt file at {}; start the daemon once to create it",
            prompt_path.display()
        );
    }

    append_version_bump(&prompt_path, reason)
        .with_context(|| format!("bumping {}", prompt_path.display()))?;

    // Mint the version record now so the new label is visible immediately;
    // a running daemon picks the same record up on its next refresh
    let db = Arc::new(Mutex::new(Database::open(&ctx.data_dir.join("brain.db"))?));
    let version = resolve_prompt_version(&db, &prompt_path, &ctx.data_dir)?;

    println!("prompt bumped to {} ({})", version.label, reason);
    println!("existing nodes become reanalysis candidates on the next schedule");
    Ok(())
}
