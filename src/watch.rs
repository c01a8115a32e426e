//! The watcher — the system's heartbeat.
//!
//! A single loop polls for the trigger file and due schedule entries, fires
//! ticks synchronously (ticks never overlap), and records crashes for
//! external consumers. The paused sentinel suppresses everything.

use std::path::Path;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};

use crate::config::PromptCache;
use crate::error::KernelError;
use crate::notifications::send_crash_notification;
use crate::provider::SessionProvider;
use crate::state::InstanceState;
use crate::tick::run_tick;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Why a tick is being fired.
#[derive(Debug, Clone, PartialEq)]
pub enum Wake {
    Trigger(String),
    Scheduled(String),
}

impl Wake {
    pub fn reason(&self) -> &str {
        match self {
            Wake::Trigger(reason) | Wake::Scheduled(reason) => reason,
        }
    }
}

/// Sample the trigger file: its presence alone fires a tick, its contents
/// are the reason. The file is deleted before the tick starts.
fn poll_trigger(data: &Path) -> Option<String> {
    let trigger = crate::paths::trigger_file(data);
    if !trigger.exists() {
        return None;
    }
    let reason = std::fs::read_to_string(&trigger)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let _ = std::fs::remove_file(&trigger);
    Some(if reason.is_empty() {
        "manual".to_string()
    } else {
        reason
    })
}

/// One watcher sample: trigger file first, then the earliest due schedule
/// entry. Callers must have already checked the paused sentinel — a present
/// trigger is either consumed into a tick or left alone, never discarded.
pub fn next_wake(data: &Path, now: u64) -> Option<Wake> {
    if let Some(reason) = poll_trigger(data) {
        return Some(Wake::Trigger(reason));
    }
    crate::schedule::take_due(data, now).map(|entry| Wake::Scheduled(entry.reason))
}

/// Watch for triggers and run ticks until interrupted.
pub async fn run_watcher<P: SessionProvider>(
    provider: &P,
    data: &Path,
    instance_id: &str,
    interval: Duration,
) -> Result<(), KernelError> {
    crate::config::ensure_dirs(data)?;

    // Bring the container up before the first tick so in-container daemons
    // can run; failure here is survivable (the tick retries).
    match crate::container::ensure_ready(data, instance_id).await {
        Ok(handle) => tracing::info!(container = handle.name(), "container ready"),
        Err(e) => tracing::error!("container startup failed: {e}"),
    }

    let state = InstanceState::load(data);
    tracing::info!("=== tock watcher ===");
    tracing::info!(tick_count = state.tick_count, "watching for triggers");

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| KernelError::io("registering SIGTERM handler", e))?;
    let mut prompt_cache = PromptCache::new();
    let mut pause_logged = false;

    loop {
        let paused = crate::paths::paused_file(data);
        if paused.exists() {
            if !pause_logged {
                tracing::warn!(
                    "paused due to fatal error; delete {} to resume",
                    paused.display()
                );
                pause_logged = true;
            }
        } else {
            pause_logged = false;

            if let Some(wake) = next_wake(data, crate::util::now_epoch()) {
                match &wake {
                    Wake::Trigger(reason) => tracing::info!(%reason, "tick triggered"),
                    Wake::Scheduled(reason) => tracing::info!(%reason, "scheduled wake"),
                }

                match run_tick(provider, data, instance_id, &mut prompt_cache).await {
                    Ok(outcome) => {
                        tracing::info!(
                            tick = outcome.tick,
                            status = outcome.status.as_str(),
                            "tick finished"
                        );
                    }
                    Err(e) => {
                        let text = format!("Tick error: {e}");
                        tracing::error!("{text}");
                        send_crash_notification(data, &text);
                    }
                }
                tracing::info!("waiting for triggers");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watcher interrupted");
                return Ok(());
            }
            _ = sigterm.recv() => {
                tracing::info!("watcher received SIGTERM");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        dir
    }

    #[test]
    fn trigger_file_consumed_with_reason() {
        let dir = data_repo();
        std::fs::write(crate::paths::trigger_file(dir.path()), "hello\n").unwrap();

        assert_eq!(
            next_wake(dir.path(), 0),
            Some(Wake::Trigger("hello".into()))
        );
        assert!(!crate::paths::trigger_file(dir.path()).exists());
        assert_eq!(next_wake(dir.path(), 0), None);
    }

    #[test]
    fn empty_trigger_reads_as_manual() {
        let dir = data_repo();
        std::fs::write(crate::paths::trigger_file(dir.path()), "").unwrap();
        assert_eq!(
            next_wake(dir.path(), 0),
            Some(Wake::Trigger("manual".into()))
        );
    }

    #[test]
    fn schedule_fires_when_no_trigger() {
        let dir = data_repo();
        std::fs::write(
            crate::paths::schedule_file(dir.path()),
            r#"[{"id": "w1", "due_at": 100, "reason": "morning check"}]"#,
        )
        .unwrap();

        assert_eq!(next_wake(dir.path(), 99), None);
        assert_eq!(
            next_wake(dir.path(), 100),
            Some(Wake::Scheduled("morning check".into()))
        );
        // Consumed exactly once.
        assert_eq!(next_wake(dir.path(), 100), None);
    }

    #[test]
    fn trigger_takes_precedence_over_schedule() {
        let dir = data_repo();
        std::fs::write(crate::paths::trigger_file(dir.path()), "urgent").unwrap();
        std::fs::write(
            crate::paths::schedule_file(dir.path()),
            r#"[{"id": "w1", "due_at": 0, "reason": "routine"}]"#,
        )
        .unwrap();

        assert_eq!(
            next_wake(dir.path(), 10),
            Some(Wake::Trigger("urgent".into()))
        );
        // The schedule entry is still there for the next sample.
        assert_eq!(
            next_wake(dir.path(), 10),
            Some(Wake::Scheduled("routine".into()))
        );
    }
}
