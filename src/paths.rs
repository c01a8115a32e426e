use std::path::{Path, PathBuf};

// ── Data-repo layout ─────────────────────────────────────

pub fn system_dir(data: &Path) -> PathBuf {
    data.join("system")
}

pub fn logs_dir(data: &Path) -> PathBuf {
    data.join("system").join("logs")
}

/// Per-closed-terminal archives, named `tty_N-tick-NNN`.
pub fn session_archive_dir(data: &Path) -> PathBuf {
    logs_dir(data).join("sessions")
}

/// Wiped at the start and end of every tick.
pub fn tmp_dir(data: &Path) -> PathBuf {
    data.join("tmp")
}

pub fn sessions_dir(data: &Path) -> PathBuf {
    tmp_dir(data).join("sessions")
}

pub fn live_status_file(data: &Path) -> PathBuf {
    tmp_dir(data).join("live_status.json")
}

pub fn state_file(data: &Path) -> PathBuf {
    system_dir(data).join("state.json")
}

pub fn paused_file(data: &Path) -> PathBuf {
    system_dir(data).join("paused")
}

pub fn trigger_file(data: &Path) -> PathBuf {
    system_dir(data).join("tick_trigger")
}

pub fn schedule_file(data: &Path) -> PathBuf {
    system_dir(data).join("schedule.json")
}

pub fn crash_notify_file(data: &Path) -> PathBuf {
    system_dir(data).join("crash_notify.txt")
}

pub fn crash_state_file(data: &Path) -> PathBuf {
    system_dir(data).join("crash_state.json")
}

pub fn agent_config_file(data: &Path) -> PathBuf {
    system_dir(data).join("agent_config.json")
}

pub fn prompt_file(data: &Path) -> PathBuf {
    system_dir(data).join("prompt.md")
}

pub fn agents_file(data: &Path) -> PathBuf {
    system_dir(data).join("agents.json")
}

pub fn startup_file(data: &Path) -> PathBuf {
    system_dir(data).join("startup.json")
}

pub fn notifications_dir(data: &Path) -> PathBuf {
    system_dir(data).join("notifications")
}

pub fn hooks_dir(data: &Path, point: &str) -> PathBuf {
    system_dir(data).join("hooks").join(point)
}

/// Image build context: `system/container/` with its Containerfile.
pub fn container_build_dir(data: &Path) -> PathBuf {
    system_dir(data).join("container")
}

pub fn tick_log_file(data: &Path, tick: u64) -> PathBuf {
    logs_dir(data).join(format!("tick-{tick:03}.jsonl"))
}

// ── Per-user paths ───────────────────────────────────────

/// Registry directory: `~/.config/tock/`, overridable with `TOCK_CONFIG_DIR`
/// (used by tests and sandboxed deployments).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOCK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tock")
}

pub fn registry_file() -> PathBuf {
    config_dir().join("instances.json")
}

/// Where `tock init <url>` clones data repos: `~/.local/share/tock/`.
pub fn data_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tock")
}

pub fn systemd_user_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("systemd")
        .join("user")
}
