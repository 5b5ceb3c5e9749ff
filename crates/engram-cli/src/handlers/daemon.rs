use anyhow::{Context, Result, bail};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use engram_index::Database;
use engram_runtime::{Daemon, any_fatal, run_preflight};

use crate::commands::CliContext;
use crate::handlers::health::print_checks;

fn pidfile(data_dir: &Path) -> PathBuf {
    data_dir.join("engramd.pid")
}

fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("engram.log")
}

fn read_pid(data_dir: &Path) -> Option<i32> {
    std::fs::read_to_string(pidfile(data_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

pub fn start(ctx: CliContext) -> Result<()> {
    std::fs::create_dir_all(&ctx.data_dir)
        .with_context(|| format!("creating {}", ctx.data_dir.display()))?;

    let log_file = log_path(&ctx.data_dir);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Arc::new(file).and(std::io::stderr))
        .with_ansi(false)
        .init();

    if let Some(pid) = read_pid(&ctx.data_dir)
        && process_alive(pid)
    {
        bail!(
            "daemon already running with pid {} (see logs at {})",
            pid,
            log_file.display()
        );
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        // Preflight with the credential roundtrip; any fatal aborts startup
        let db = Arc::new(Mutex::new(Database::open(&ctx.data_dir.join("brain.db"))?));
        let cancel = tokio_util::sync::CancellationToken::new();
        let checks = run_preflight(&ctx.config, &ctx.data_dir, &db, true, &cancel).await;
        drop(db);
        print_checks(&checks);
        if any_fatal(&checks) {
            bail!(
                "preflight failed; daemon not started (see logs at {})",
                log_file.display()
            );
        }

        std::fs::write(pidfile(&ctx.data_dir), std::process::id().to_string())?;

        let daemon = Daemon::start(
            ctx.data_dir.clone(),
            ctx.config.clone(),
            ctx.config_path.clone(),
        )
        .await?;
        let handle = daemon.handle();

        // HTTP surface runs until the shared cancellation token fires
        let api = tokio::spawn(engram_api::serve(handle.clone()));

        println!(
            "engram daemon running (api {}:{}, prompt {})",
            handle.config_snapshot().api_host,
            handle.config_snapshot().api_port,
            handle.prompt.label()
        );

        wait_for_shutdown_signal().await;
        println!("shutting down...");

        daemon.shutdown().await;
        let _ = api.await;

        let _ = std::fs::remove_file(pidfile(&ctx.data_dir));
        Ok(())
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub fn stop(ctx: CliContext) -> Result<()> {
    let Some(pid) = read_pid(&ctx.data_dir) else {
        bail!("no pidfile at {}; daemon not running?", pidfile(&ctx.data_dir).display());
    };
    if !process_alive(pid) {
        let _ = std::fs::remove_file(pidfile(&ctx.data_dir));
        bail!("stale pidfile removed; daemon was not running");
    }

    #[cfg(unix)]
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    // Wait out the drain grace before declaring failure
    let deadline =
        std::time::Instant::now() + Duration::from_secs(ctx.config.drain_grace_seconds + 5);
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            println!("daemon (pid {}) stopped", pid);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    bail!("daemon (pid {}) did not stop within the drain grace", pid)
}

pub fn status(ctx: CliContext) -> Result<()> {
    match read_pid(&ctx.data_dir) {
        Some(pid) if process_alive(pid) => {
            println!("daemon running (pid {})", pid);
        }
        _ => {
            println!("daemon not running");
            return Ok(());
        }
    }

    // Enrich from the HTTP surface when reachable
    let url = format!(
        "http://{}:{}/api/v1/status",
        ctx.config.api_host, ctx.config.api_port
    );
    let runtime = tokio::runtime::Runtime::new()?;
    let status: Result<serde_json::Value> = runtime.block_on(async {
        let response = reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    });

    match status {
        Ok(body) => {
            let data = &body["data"];
            println!("  prompt:     {}", data["promptVersion"].as_str().unwrap_or("?"));
            println!("  nodes:      {}", data["nodes"]);
            println!("  edges:      {}", data["edges"]);
            println!("  embeddings: {}", data["embeddings"]);
            println!("  jobs:       {}", data["jobs"]);
            println!("  uptime:     {}s", data["uptimeSeconds"]);
        }
        Err(e) => {
            println!("  (status endpoint unreachable: {})", e);
        }
    }
    Ok(())
}
