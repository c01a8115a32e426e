//! Mid-tick notifications and crash reporting.
//!
//! External producers drop `*.txt` files into `system/notifications/`; during
//! an active tick each file is delivered into the live session exactly once,
//! in creation order, and deleted after delivery. Outside a tick the files
//! simply accumulate until the next tick consumes them at start.
//!
//! The crash notification writer lives here too: a single
//! `system/crash_notify.txt` for external consumers, rate-limited so a crash
//! loop doesn't spam whatever forwards it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use facet::Facet;
use notify::{RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::util::write_atomic;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CRASH_SUPPRESS_SECS: u64 = 1800;
const CRASH_MAX_BYTES: usize = 1500;

// ── Crash notifications ──────────────────────────────────

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
struct CrashState {
    #[facet(default)]
    last_notify_epoch: u64,
    #[facet(default)]
    error_hash: String,
}

/// Write `system/crash_notify.txt` for external consumers. The same error
/// hash within 30 minutes is suppressed.
pub fn send_crash_notification(data: &Path, error: &str) {
    let state_file = crate::paths::crash_state_file(data);
    let notify_file = crate::paths::crash_notify_file(data);
    let now = crate::util::now_epoch();

    let state: CrashState = std::fs::read_to_string(&state_file)
        .ok()
        .and_then(|s| facet_json::from_str(&s).ok())
        .unwrap_or_default();

    let digest = Sha256::digest(error.as_bytes());
    let error_hash: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();

    if state.error_hash == error_hash
        && now.saturating_sub(state.last_notify_epoch) < CRASH_SUPPRESS_SECS
    {
        tracing::debug!("crash notification suppressed (duplicate within 30m)");
        return;
    }

    if let Err(e) = write_atomic(&notify_file, crate::util::truncate(error, CRASH_MAX_BYTES)) {
        tracing::warn!("failed to write crash notification: {e}");
        return;
    }
    tracing::info!("crash notification written");

    let new_state = CrashState {
        last_notify_epoch: now,
        error_hash,
    };
    let _ = write_atomic(&state_file, &facet_json::to_string(&new_state).unwrap_or_default());
}

// ── Notification watcher ─────────────────────────────────

/// One notification ready for injection. The file is deleted by the tick
/// engine after the injection succeeds (at-most-once delivery).
#[derive(Debug)]
pub struct Notification {
    pub path: PathBuf,
    pub text: String,
}

pub struct Notifier {
    task: JoinHandle<()>,
}

impl Notifier {
    /// Watch `system/notifications/` and stream `*.txt` contents in creation
    /// order. Uses filesystem events where available; a 500 ms poll runs
    /// alongside to catch anything the event stream misses. Pre-existing
    /// files (written between trigger and tick start) are delivered first.
    pub fn spawn(data: &Path) -> (Self, mpsc::Receiver<Notification>) {
        let dir = crate::paths::notifications_dir(data);
        let (tx, rx) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            let _ = std::fs::create_dir_all(&dir);

            // Filesystem events feed a wakeup channel; the sweep does the
            // actual reading so event and poll paths share one code path.
            let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<()>();
            let _watcher = match notify::recommended_watcher(
                move |res: Result<notify::Event, notify::Error>| {
                    if let Ok(event) = res
                        && (event.kind.is_create() || event.kind.is_modify())
                    {
                        let _ = wake_tx.send(());
                    }
                },
            ) {
                Ok(mut w) => match w.watch(&dir, RecursiveMode::NonRecursive) {
                    Ok(()) => Some(w),
                    Err(e) => {
                        tracing::debug!("notification watch failed, polling only: {e}");
                        None
                    }
                },
                Err(e) => {
                    tracing::debug!("notification watcher unavailable, polling only: {e}");
                    None
                }
            };

            let mut seen: HashSet<PathBuf> = HashSet::new();
            loop {
                if sweep(&dir, &mut seen, &tx).await.is_err() {
                    return; // receiver dropped, tick is over
                }
                tokio::select! {
                    _ = wake_rx.recv() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        });

        (Self { task }, rx)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Enqueue unseen `*.txt` files in creation order. Errors only when the
/// receiver is gone.
async fn sweep(
    dir: &Path,
    seen: &mut HashSet<PathBuf>,
    tx: &mpsc::Sender<Notification>,
) -> Result<(), ()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };

    let mut fresh: Vec<(u64, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().and_then(|x| x.to_str()) == Some("txt") && !seen.contains(p)
        })
        .map(|p| (created_epoch(&p), p))
        .collect();
    fresh.sort();

    for (_, path) in fresh {
        seen.insert(path.clone());
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            let _ = std::fs::remove_file(&path);
            continue;
        }
        tracing::info!("notification: {}", crate::util::truncate(&text, 80));
        if tx.send(Notification { path, text }).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

fn created_epoch(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.created().or_else(|_| m.modified()))
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(u64::MAX)
}
