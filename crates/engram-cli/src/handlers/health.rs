use anyhow::{Result, bail};
use std::sync::{Arc, Mutex};

use engram_index::Database;
use engram_runtime::{CheckResult, any_fatal, run_preflight};

use crate::commands::CliContext;

pub fn print_checks(checks: &[CheckResult]) {
    for check in checks {
        let mark = if check.passed {
            "ok"
        } else if check.fatal {
            "FAIL"
        } else {
            "warn"
        };
        println!("  [{:>4}] {:<20} {}", mark, check.name, check.message);
    }
}

pub fn run(ctx: CliContext, roundtrip: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let checks = runtime.block_on(async {
        let db = Database::open(&ctx.data_dir.join("brain.db"))
            .map(|db| Arc::new(Mutex::new(db)));
        match db {
            Ok(db) => {
                let cancel = tokio_util::sync::CancellationToken::new();
                run_preflight(&ctx.config, &ctx.data_dir, &db, roundtrip, &cancel).await
            }
            Err(e) => vec![CheckResult {
                name: "database".to_string(),
                passed: false,
                message: e.to_string(),
                fatal: true,
            }],
        }
    });

    println!("engram health ({}):", ctx.data_dir.display());
    print_checks(&checks);

    if any_fatal(&checks) {
        bail!("fatal check failed");
    }
    println!("all checks passed");
    Ok(())
}
