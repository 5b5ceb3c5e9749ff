use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Resolved analyzer configuration shared across invocations.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub binary: PathBuf,
    pub provider: String,
    pub model: String,
    pub system_prompt_path: PathBuf,
    pub skills: Vec<String>,
}

/// One invocation: the JSON payload written to stdin, the instruction
/// string, and the deadline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub instructions: String,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    /// Grace between SIGTERM and SIGKILL on orderly shutdown
    pub term_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RawOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[cfg(unix)]
fn put_in_own_process_group(cmd: &mut Command) {
    // The analyzer spawns its own children; killing the group is the only
    // way to take the whole tree down on timeout.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn put_in_own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    unsafe {
        // setsid made the child the leader of its own group (pgid == pid)
        libc::killpg(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: i32) {}

async fn drain<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn kill_group_and_reap(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        signal_group(pid, libc_sigterm());
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        signal_group(pid, libc_sigkill());
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}
#[cfg(unix)]
fn libc_sigkill() -> i32 {
    libc::SIGKILL
}
#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    0
}
#[cfg(not(unix))]
fn libc_sigkill() -> i32 {
    0
}

/// Spawn the analyzer for one job and wait for it under a deadline.
///
/// Timeout kills the process group and reports `timed_out = true` so the
/// caller classifies it transient. Cancellation terminates gracefully and
/// returns `Error::Interrupted` - the job's lease is released, not failed.
pub async fn invoke(
    config: &AnalyzerConfig,
    invocation: &Invocation,
    cancel: &CancellationToken,
) -> Result<RawOutput> {
    if !config.binary.exists() {
        return Err(Error::MissingBinary(config.binary.clone()));
    }

    let mut cmd = Command::new(&config.binary);
    cmd.arg("--provider")
        .arg(&config.provider)
        .arg("--model")
        .arg(&config.model)
        .arg("--system-prompt")
        .arg(&config.system_prompt_path)
        .arg("--skills")
        .arg(config.skills.join(","))
        .arg("--no-session")
        .arg("--mode")
        .arg("json")
        .arg("-p")
        .arg(&invocation.instructions)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    put_in_own_process_group(&mut cmd);

    let mut child = cmd.spawn().map_err(Error::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&invocation.payload)
            .map_err(|e| Error::InvalidOutput(e.to_string()))?;
        // A dead child is reported through wait(), not the stdin write
        let _ = stdin.write_all(&payload).await;
        let _ = stdin.shutdown().await;
    }

    let stdout_task = tokio::spawn(drain(child.stdout.take()));
    let stderr_task = tokio::spawn(drain(child.stderr.take()));

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(Error::Spawn)?;
            (status.code(), false)
        }
        _ = tokio::time::sleep(invocation.timeout) => {
            tracing::warn!(
                binary = %config.binary.display(),
                timeout_secs = invocation.timeout.as_secs(),
                "analyzer timed out; killing process group"
            );
            if let Some(pid) = child.id() {
                signal_group(pid, libc_sigkill());
            }
            let _ = child.wait().await;
            (None, true)
        }
        _ = cancel.cancelled() => {
            tracing::info!("shutdown requested; terminating analyzer");
            kill_group_and_reap(&mut child, invocation.term_grace).await;
            return Err(Error::Interrupted);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(RawOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}
