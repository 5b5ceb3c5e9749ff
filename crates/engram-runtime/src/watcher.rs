use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

use engram_session::is_session_file;

use crate::Result;

/// One observed change to a session file. The watcher never reads file
/// contents; it only reflects (path, mtime, size).
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Watches session roots with native notifications plus a periodic rescan.
///
/// The rescan is both the polling fallback for filesystems that do not
/// deliver notifications (network mounts) and the re-probe for roots that
/// appear after startup. Either path eventually observes every change;
/// the debounce window coalesces notification bursts.
pub struct SessionWatcher {
    _watcher: Option<RecommendedWatcher>,
    _handle: JoinHandle<()>,
}

impl SessionWatcher {
    pub fn start(
        roots: Vec<PathBuf>,
        debounce: Duration,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(Self, UnboundedReceiver<FileChange>)> {
        let (tx_out, rx_out) = unbounded_channel();
        let (tx_fs, rx_fs) = channel();

        // Native notifications are best-effort; scan-based polling below is
        // the correctness backstop. Watcher failure is non-fatal.
        let watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx_fs.send(event);
            }
        }) {
            Ok(mut watcher) => {
                for root in &roots {
                    if root.exists()
                        && let Err(e) = watcher.watch(root, RecursiveMode::Recursive)
                    {
                        tracing::warn!(root = %root.display(), error = %e, "watch failed; relying on polling");
                    }
                }
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "native file notifications unavailable; polling only");
                None
            }
        };

        let handle = std::thread::Builder::new()
            .name("session-watcher".to_string())
            .spawn(move || {
                let mut state = WatchState {
                    roots,
                    tx: tx_out,
                    pending: HashMap::new(),
                    known: HashMap::new(),
                    // rescan() below resets this to the real scan time
                    last_scan: Instant::now(),
                    debounce,
                    poll_interval,
                };

                state.rescan();

                loop {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let wait = state.next_wakeup();
                    match rx_fs.recv_timeout(wait) {
                        Ok(event) => state.absorb(event),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            // Notifications are gone; keep polling
                            std::thread::sleep(wait);
                        }
                    }

                    state.flush_due();
                    if state.last_scan.elapsed() >= state.poll_interval {
                        state.rescan();
                    }
                }
            })
            .map_err(crate::Error::Io)?;

        Ok((
            Self {
                _watcher: watcher,
                _handle: handle,
            },
            rx_out,
        ))
    }
}

struct WatchState {
    roots: Vec<PathBuf>,
    tx: UnboundedSender<FileChange>,
    /// Paths seen by notifications, waiting out the debounce window
    pending: HashMap<PathBuf, Instant>,
    /// (mtime, size) last emitted per path, for the rescan diff
    known: HashMap<PathBuf, (DateTime<Utc>, u64)>,
    last_scan: Instant,
    debounce: Duration,
    poll_interval: Duration,
}

impl WatchState {
    fn next_wakeup(&self) -> Duration {
        let scan_in = self
            .poll_interval
            .saturating_sub(self.last_scan.elapsed());
        let flush_in = self
            .pending
            .values()
            .map(|seen| self.debounce.saturating_sub(seen.elapsed()))
            .min()
            .unwrap_or(self.poll_interval);
        scan_in.min(flush_in).max(Duration::from_millis(10))
    }

    fn absorb(&mut self, event: Event) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            if is_session_file(&path) {
                self.pending.insert(path, Instant::now());
            }
        }
    }

    fn flush_due(&mut self) {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            self.pending.remove(&path);
            self.emit(path);
        }
    }

    fn rescan(&mut self) {
        self.last_scan = Instant::now();
        for root in &self.roots.clone() {
            if !root.exists() {
                continue;
            }
            for path in engram_session::discover_session_files(root) {
                let Some((modified, size)) = stat(&path) else {
                    continue;
                };
                let changed = self
                    .known
                    .get(&path)
                    .map(|(m, s)| *m != modified || *s != size)
                    .unwrap_or(true);
                if changed && !self.pending.contains_key(&path) {
                    self.emit(path);
                }
            }
        }
    }

    fn emit(&mut self, path: PathBuf) {
        let Some((modified, size)) = stat(&path) else {
            return;
        };
        self.known.insert(path.clone(), (modified, size));
        let _ = self.tx.send(FileChange {
            path,
            modified,
            size,
        });
    }
}

fn stat(path: &std::path::Path) -> Option<(DateTime<Utc>, u64)> {
    let metadata = path.metadata().ok()?;
    let modified = metadata.modified().ok()?;
    Some((DateTime::<Utc>::from(modified), metadata.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_path(dir: &std::path::Path) -> PathBuf {
        let project = dir.join("---home-u-proj--");
        std::fs::create_dir_all(&project).unwrap();
        project.join("20260101T100000_7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.jsonl")
    }

    #[tokio::test]
    async fn observes_creation_and_modification() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (_watcher, mut rx) = SessionWatcher::start(
            vec![tmp.path().to_path_buf()],
            Duration::from_millis(50),
            Duration::from_millis(100),
            cancel.clone(),
        )
        .unwrap();

        let path = session_path(tmp.path());
        std::fs::write(&path, "{\"type\":\"session\"}\n").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change within poll cycle")
            .expect("channel open");
        assert_eq!(change.path, path);
        assert!(change.size > 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn ignores_non_session_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (_watcher, mut rx) = SessionWatcher::start(
            vec![tmp.path().to_path_buf()],
            Duration::from_millis(50),
            Duration::from_millis(100),
            cancel.clone(),
        )
        .unwrap();

        std::fs::write(tmp.path().join("notes.txt"), "hello").unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err(), "no event expected for non-session files");

        cancel.cancel();
    }
}
