//! Terminal manager — numbered terminals backed by tmux inside the container.
//!
//! Each terminal is a tmux session. Input is injected with `send-keys`;
//! output is captured with `capture-pane` by a background loop and written to
//! session files the agent can read with its file tools:
//!
//!   tmp/sessions/tty_N/screen       — plain text screen (visible portion)
//!   tmp/sessions/tty_N/screen.ansi  — screen with ANSI colors
//!   tmp/sessions/tty_N/raw          — raw ANSI output (from pipe-pane)
//!   tmp/sessions/tty_N/scrollback   — captured history
//!   tmp/sessions/tty_N/status       — one line: "idle", "exited (N)"
//!   tmp/sessions/registry.json      — terminal metadata for recovery
//!
//! Diff tracking uses high-water marks over captured lines. The agent must
//! observe output (wait) before type() accepts new input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use facet::Facet;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::container::ContainerHandle;
use crate::error::KernelError;
use crate::util::write_atomic;

pub const MAX_TTYS: usize = 20;
pub const MAX_WAIT_TIMEOUT: u64 = 60;
const INLINE_THRESHOLD: usize = 20;
const ELISION_HEAD: usize = 10;
const ELISION_TAIL: usize = 10;
const SETTLE_TIME: Duration = Duration::from_millis(1500);
const SETTLE_POLL: Duration = Duration::from_millis(300);
const CAPTURE_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_ROWS: usize = 40;
const DEFAULT_COLS: usize = 120;
const SCROLLBACK_LINES: usize = 5000;
const RAW_MAX_BYTES: u64 = 2_000_000;

// ── Key grammar ──────────────────────────────────────────

/// tmux key names recognized by send-keys (sent without the literal flag).
const KEY_NAMES: &[&str] = &[
    "Enter", "Escape", "Space", "Tab", "BSpace", "DC", "IC", "Up", "Down", "Left", "Right",
    "Home", "End", "PPage", "NPage", "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9",
    "F10", "F11", "F12",
];

/// True when `text` is a key token rather than literal text: a named key, or
/// a `C-x`/`M-x` combo. Key tokens never get a trailing Enter.
pub fn is_key_token(text: &str) -> bool {
    if KEY_NAMES.contains(&text) {
        return true;
    }
    if let Some(rest) = text.strip_prefix("C-").or_else(|| text.strip_prefix("M-")) {
        let n = rest.chars().count();
        return (1..=2).contains(&n);
    }
    false
}

// ── Terminal state ───────────────────────────────────────

/// One terminal slot. `seen_lines` is the high-water mark: how many captured
/// lines the agent has observed. Unseen output = `lines.len() - seen_lines`.
#[derive(Debug)]
pub struct Tty {
    pub id: usize,
    pub tmux_name: String,
    pub dir: PathBuf,
    pub lines: Vec<String>,
    pub seen_lines: usize,
    pub process_dead: bool,
    pub exit_code: Option<i32>,
    /// What the terminal was opened with (updated by a satisfied type()).
    pub command: String,
    /// Auto-detected foreground command, refreshed by the capture loop.
    pub current_command: String,
    pub created: String,
}

impl Tty {
    fn new(id: usize, sessions_dir: &Path) -> Self {
        let tmux_name = format!("tty_{id}");
        let dir = sessions_dir.join(&tmux_name);
        Self {
            id,
            tmux_name,
            dir,
            lines: Vec::new(),
            seen_lines: 0,
            process_dead: false,
            exit_code: None,
            command: "bash".into(),
            current_command: String::new(),
            created: String::new(),
        }
    }

    pub fn new_lines(&self) -> &[String] {
        if self.seen_lines >= self.lines.len() {
            return &[];
        }
        &self.lines[self.seen_lines..]
    }

    pub fn mark_seen(&mut self) {
        self.seen_lines = self.lines.len();
    }

    /// Human-facing label: the detected foreground command, falling back to
    /// what the terminal was opened with.
    pub fn label(&self) -> &str {
        if self.current_command.is_empty() {
            &self.command
        } else {
            &self.current_command
        }
    }

    fn scrollback_file(&self) -> PathBuf {
        self.dir.join("scrollback")
    }
}

/// A terminal from a previous tick whose tmux session no longer exists
/// (container restart). Reported once at login.
#[derive(Debug, Clone)]
pub struct LostTty {
    pub name: String,
    pub command: String,
    pub has_scrollback: bool,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
struct RegistryEntry {
    #[facet(default)]
    command: String,
    #[facet(default)]
    current_command: String,
    #[facet(default)]
    created: String,
    #[facet(default)]
    status: String,
    #[facet(default)]
    last_activity: String,
}

#[derive(Default)]
struct Inner {
    ttys: BTreeMap<usize, Tty>,
    stale: Vec<LostTty>,
    build_error: Option<String>,
}

// ── Manager ──────────────────────────────────────────────

pub struct TtyManager {
    data_dir: PathBuf,
    sessions_dir: PathBuf,
    archive_dir: PathBuf,
    tick_number: u64,
    container: ContainerHandle,
    inner: Mutex<Inner>,
    activity: Notify,
    interrupted: AtomicBool,
    interrupt_wake: Notify,
    running: AtomicBool,
    capture_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TtyManager {
    pub fn new(data_dir: &Path, tick_number: u64, container: ContainerHandle) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            sessions_dir: crate::paths::sessions_dir(data_dir),
            archive_dir: crate::paths::session_archive_dir(data_dir),
            tick_number,
            container,
            inner: Mutex::new(Inner::default()),
            activity: Notify::new(),
            interrupted: AtomicBool::new(false),
            interrupt_wake: Notify::new(),
            running: AtomicBool::new(false),
            capture_task: StdMutex::new(None),
        }
    }

    pub fn set_build_error(&self, error: Option<String>) {
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.build_error = error;
        }
    }

    /// Start the background capture loop and detect terminals lost to a
    /// container restart. The container must already be running.
    pub async fn start(self: std::sync::Arc<Self>) -> Result<(), KernelError> {
        std::fs::create_dir_all(&self.sessions_dir)
            .map_err(|e| KernelError::io(format!("creating {}", self.sessions_dir.display()), e))?;
        self.running.store(true, Ordering::SeqCst);

        let mgr = std::sync::Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CAPTURE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !mgr.running.load(Ordering::SeqCst) {
                    return;
                }
                if mgr.capture_all().await {
                    mgr.activity.notify_waiters();
                }
            }
        });
        *self.capture_task.lock().unwrap() = Some(task);

        self.detect_stale().await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self.capture_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    /// Interrupt a blocking wait (e.g. a notification arrived): the wait
    /// skips its settle phase and returns accumulated output immediately.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_wake.notify_waiters();
    }

    // ── Queries ──────────────────────────────────────────

    pub async fn slots(&self) -> Vec<usize> {
        self.inner.lock().await.ttys.keys().copied().collect()
    }

    pub async fn exists(&self, slot: usize) -> bool {
        self.inner.lock().await.ttys.contains_key(&slot)
    }

    pub async fn label_of(&self, slot: usize) -> Option<String> {
        self.inner
            .lock()
            .await
            .ttys
            .get(&slot)
            .map(|t| t.label().to_string())
    }

    /// True when any terminal has output the agent hasn't observed. A dead
    /// terminal with unreported history counts too.
    pub async fn has_unseen(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .ttys
            .values()
            .any(|t| !t.new_lines().is_empty() || (t.process_dead && t.seen_lines < t.lines.len()))
    }

    pub async fn take_lost(&self) -> Vec<LostTty> {
        std::mem::take(&mut self.inner.lock().await.stale)
    }

    pub async fn take_build_error(&self) -> Option<String> {
        self.inner.lock().await.build_error.take()
    }

    /// Record the label the agent pointed at once a type() was satisfied.
    pub async fn confirm_label(&self, slot: usize, label: &str) {
        if let Some(tty) = self.inner.lock().await.ttys.get_mut(&slot) {
            tty.command = label.to_string();
        }
    }

    // ── Lifecycle ────────────────────────────────────────

    /// Allocate the lowest free slot and start a session in it. Returns the
    /// slot and how many more terminals can be opened.
    pub async fn open_lowest(&self, command: &str) -> Result<(usize, usize), KernelError> {
        let slot = {
            let inner = self.inner.lock().await;
            (0..MAX_TTYS).find(|i| !inner.ttys.contains_key(i))
        };
        let Some(slot) = slot else {
            return Err(KernelError::Validation {
                message: format!("Terminal limit reached ({MAX_TTYS})."),
            });
        };
        self.get_or_create(slot, command).await?;
        let remaining = MAX_TTYS - self.inner.lock().await.ttys.len();
        Ok((slot, remaining))
    }

    /// Create a terminal in `slot` (or reconnect to a surviving session of
    /// the same name after a hot reload).
    pub async fn get_or_create(&self, slot: usize, command: &str) -> Result<(), KernelError> {
        {
            let inner = self.inner.lock().await;
            if let Some(tty) = inner.ttys.get(&slot) {
                if !tty.process_dead {
                    return Ok(());
                }
            } else if inner.ttys.len() >= MAX_TTYS {
                return Err(KernelError::Validation {
                    message: format!("Terminal limit reached ({MAX_TTYS})."),
                });
            }
        }

        let mut tty = Tty::new(slot, &self.sessions_dir);
        tty.command = command.to_string();
        tty.created = crate::logging::utc_timestamp();
        std::fs::create_dir_all(&tty.dir)
            .map_err(|e| KernelError::io(format!("creating {}", tty.dir.display()), e))?;

        if self.session_exists(&tty.tmux_name).await {
            tracing::info!(slot, "reconnecting to surviving tmux session");
            self.setup_pipe(&tty).await?;
        } else {
            self.create_session(&tty, command).await?;
            self.setup_pipe(&tty).await?;
        }

        // Initial capture; existing content is not diffed to the agent.
        let mut inner = self.inner.lock().await;
        self.capture_tty(&mut tty).await;
        tty.mark_seen();
        inner.ttys.insert(slot, tty);
        self.save_registry(&inner);
        Ok(())
    }

    /// Send keystrokes to an existing terminal. Key tokens go through tmux
    /// key parsing; anything else is sent literally.
    pub async fn send_keys(&self, slot: usize, text: &str) -> Result<(), KernelError> {
        let tmux_name = {
            let inner = self.inner.lock().await;
            let tty = inner.ttys.get(&slot).ok_or_else(|| KernelError::Validation {
                message: format!("Terminal {slot} does not exist."),
            })?;
            tty.tmux_name.clone()
        };

        if is_key_token(text) {
            self.container
                .exec(&["tmux", "send-keys", "-t", &tmux_name, text])
                .await?;
        } else {
            self.container
                .exec(&["tmux", "send-keys", "-t", &tmux_name, "-l", text])
                .await?;
        }
        Ok(())
    }

    /// Close a terminal: kill the tmux session, flush a final capture, and
    /// archive its directory. Returns false when the slot isn't open.
    pub async fn close(&self, slot: usize) -> bool {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner, slot).await
    }

    async fn close_locked(&self, inner: &mut Inner, slot: usize) -> bool {
        let Some(mut tty) = inner.ttys.remove(&slot) else {
            return false;
        };
        self.capture_tty(&mut tty).await;
        if let Err(e) = self
            .container
            .exec(&["tmux", "kill-session", "-t", &tty.tmux_name])
            .await
        {
            tracing::debug!(slot, "kill-session failed (already dead?): {e}");
        }
        archive_tty_dir(&self.archive_dir, &tty.dir, self.tick_number);
        self.save_registry(inner);
        true
    }

    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        let slots: Vec<usize> = inner.ttys.keys().copied().collect();
        for slot in slots {
            self.close_locked(&mut inner, slot).await;
        }
    }

    // ── Wait / settle ────────────────────────────────────

    /// Block until terminal output settles, then return a status summary of
    /// every open terminal with unobserved output rendered as diffs.
    ///
    /// All high-water marks advance atomically with the snapshot the summary
    /// was built from. Terminals whose process exited are reported once and
    /// auto-closed. A zero timeout skips waiting entirely and reports
    /// whatever has accumulated.
    pub async fn wait_for_activity(&self, timeout_secs: u64, build_summary: bool) -> String {
        let timeout_secs = timeout_secs.min(MAX_WAIT_TIMEOUT);
        self.interrupted.store(false, Ordering::SeqCst);

        let mut interrupted = false;
        if timeout_secs > 0 {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

            // Phase 1: first activity, interrupt, or timeout.
            tokio::select! {
                _ = self.activity.notified() => {}
                _ = self.interrupt_wake.notified() => interrupted = true,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            if self.interrupted.swap(false, Ordering::SeqCst) {
                interrupted = true;
            }

            // Phase 2: settle. Poll until no terminal produced new output for
            // SETTLE_TIME or the deadline passes. The settle window always
            // gets a little runway even when phase 1 consumed the whole
            // timeout waiting for the first activity.
            if !interrupted {
                let settle_deadline =
                    deadline.max(tokio::time::Instant::now() + SETTLE_TIME + Duration::from_secs(1));
                let mut settle_start = tokio::time::Instant::now();
                while tokio::time::Instant::now() < settle_deadline {
                    if self.interrupted.swap(false, Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(SETTLE_POLL).await;
                    if self.capture_all().await {
                        settle_start = tokio::time::Instant::now();
                    } else if tokio::time::Instant::now() - settle_start >= SETTLE_TIME {
                        break;
                    }
                }
            }
        }

        if !build_summary {
            return String::new();
        }

        let mut inner = self.inner.lock().await;
        let summary = build_status_summary(&mut inner.ttys);

        let dead: Vec<usize> = inner
            .ttys
            .iter()
            .filter(|(_, t)| t.process_dead)
            .map(|(id, _)| *id)
            .collect();
        for slot in dead {
            self.close_locked(&mut inner, slot).await;
        }

        if summary.is_empty() {
            "No activity, timeout reached.".into()
        } else {
            summary
        }
    }

    // ── Capture ──────────────────────────────────────────

    async fn capture_all(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let mut changed = false;
        for tty in inner.ttys.values_mut() {
            if self.capture_tty(tty).await {
                changed = true;
            }
        }
        if changed {
            self.save_registry(&inner);
        }
        changed
    }

    /// Capture one terminal's buffer into its session files. Returns true if
    /// content (or the detected foreground command) changed.
    async fn capture_tty(&self, tty: &mut Tty) -> bool {
        let prev_command = tty.current_command.clone();
        self.refresh_status(tty).await;
        let command_changed = tty.current_command != prev_command;

        let scrollback_arg = format!("-{SCROLLBACK_LINES}");
        let content = match self
            .container
            .exec(&[
                "tmux",
                "capture-pane",
                "-p",
                "-t",
                &tty.tmux_name,
                "-S",
                &scrollback_arg,
            ])
            .await
        {
            Ok(content) => content,
            Err(_) => {
                // tmux session gone
                if !tty.process_dead {
                    tty.process_dead = true;
                    write_status_file(tty);
                    return true;
                }
                return command_changed;
            }
        };

        let mut lines: Vec<String> = content.split('\n').map(String::from).collect();
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }

        if lines == tty.lines {
            return command_changed;
        }

        let old_len = tty.lines.len();
        let new_len = lines.len();
        if new_len < tty.seen_lines {
            // Screen cleared or buffer shrunk drastically
            tty.seen_lines = 0;
        } else if old_len > 0 && new_len == old_len {
            // Buffer full and sliding: old lines fell off the top. Find the
            // shift and move the high-water mark with it.
            let shift = detect_buffer_shift(&tty.lines, &lines);
            tty.seen_lines = tty.seen_lines.saturating_sub(shift);
        }
        tty.lines = lines;

        let scrollback = tty.lines.join("\n");
        let scrollback = if scrollback.is_empty() {
            scrollback
        } else {
            format!("{scrollback}\n")
        };
        if let Err(e) = std::fs::write(tty.scrollback_file(), &scrollback) {
            tracing::debug!(slot = tty.id, "write scrollback failed: {e}");
        }

        let visible = if tty.lines.len() > DEFAULT_ROWS {
            &tty.lines[tty.lines.len() - DEFAULT_ROWS..]
        } else {
            &tty.lines[..]
        };
        let screen = if visible.is_empty() {
            String::new()
        } else {
            format!("{}\n", visible.join("\n"))
        };
        if let Err(e) = std::fs::write(tty.dir.join("screen"), &screen) {
            tracing::debug!(slot = tty.id, "write screen failed: {e}");
        }

        if let Ok(ansi) = self
            .container
            .exec(&["tmux", "capture-pane", "-p", "-e", "-t", &tty.tmux_name])
            .await
        {
            let mut ansi_lines: Vec<&str> = ansi.split('\n').collect();
            while ansi_lines.last().is_some_and(|l| l.trim().is_empty()) {
                ansi_lines.pop();
            }
            let ansi_screen = if ansi_lines.is_empty() {
                String::new()
            } else {
                format!("{}\n", ansi_lines.join("\n"))
            };
            let _ = std::fs::write(tty.dir.join("screen.ansi"), ansi_screen);
        }

        write_status_file(tty);
        rotate_raw_if_needed(tty);
        true
    }

    /// Refresh exit state and the detected foreground command via list-panes.
    async fn refresh_status(&self, tty: &mut Tty) {
        if tty.process_dead {
            return;
        }
        let result = self
            .container
            .exec(&[
                "tmux",
                "list-panes",
                "-t",
                &tty.tmux_name,
                "-F",
                "#{pane_dead}|#{pane_dead_status}|#{pane_current_command}|#{pane_pid}",
            ])
            .await;

        let line = match result {
            Ok(out) => out.trim().to_string(),
            Err(_) => {
                // Session doesn't exist = process is dead
                tty.process_dead = true;
                return;
            }
        };

        let parts: Vec<&str> = line.splitn(4, '|').collect();
        if parts.len() < 3 {
            return;
        }
        let (dead, exit_status, cmd) = (parts[0], parts[1], parts[2]);
        let pane_pid = parts.get(3).copied().unwrap_or("");

        if dead == "1" {
            tty.process_dead = true;
            tty.exit_code = exit_status.parse().ok();
            tracing::info!(slot = tty.id, exit_code = ?tty.exit_code, "terminal process exited");
        } else if !cmd.is_empty() {
            tty.current_command = self.resolve_command_name(cmd, pane_pid).await;
        }
    }

    /// Resolve a script name when tmux reports a bare interpreter. A script
    /// run via shebang shows up as e.g. "python3"; the child's cmdline gives
    /// the actual script name.
    async fn resolve_command_name(&self, cmd: &str, pane_pid: &str) -> String {
        const INTERPRETERS: &[&str] = &["python3", "python", "node", "ruby", "perl", "bash", "sh"];
        if !INTERPRETERS.contains(&cmd) || pane_pid.is_empty() {
            return cmd.to_string();
        }

        let children = match self
            .container
            .exec(&["ps", "-o", "pid=", "--ppid", pane_pid])
            .await
        {
            Ok(out) => out,
            Err(_) => return cmd.to_string(),
        };
        let child_pid = children.split_whitespace().next().unwrap_or("");
        if child_pid.is_empty() || !child_pid.chars().all(|c| c.is_ascii_digit()) {
            return cmd.to_string();
        }

        let cmdline_path = format!("/proc/{child_pid}/cmdline");
        let Ok(cmdline) = self.container.exec(&["cat", &cmdline_path]).await else {
            return cmd.to_string();
        };
        let argv: Vec<&str> = cmdline.split('\0').collect();
        if argv.len() >= 2 && argv[1].contains('/') {
            return argv[1].rsplit('/').next().unwrap_or(cmd).to_string();
        }
        cmd.to_string()
    }

    // ── tmux plumbing ────────────────────────────────────

    async fn session_exists(&self, name: &str) -> bool {
        self.container
            .exec(&["tmux", "has-session", "-t", name])
            .await
            .is_ok()
    }

    async fn create_session(&self, tty: &Tty, command: &str) -> Result<(), KernelError> {
        let env = [
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("DATA_DIR".to_string(), self.data_dir.display().to_string()),
        ];
        let cols = DEFAULT_COLS.to_string();
        let rows = DEFAULT_ROWS.to_string();
        let mut argv: Vec<&str> = vec![
            "tmux",
            "new-session",
            "-d",
            "-s",
            &tty.tmux_name,
            "-x",
            &cols,
            "-y",
            &rows,
        ];
        let launch;
        if command != "bash" {
            launch = format!("bash -c {}", shell_escape(command));
            argv.push(&launch);
        }

        tracing::info!(slot = tty.id, command, "creating tmux session");
        let out = self
            .container
            .exec_env(&env, &argv, Duration::from_secs(30))
            .await;
        if !out.ok() {
            return Err(KernelError::ExternalCommand {
                command: "tmux new-session".into(),
                message: out.stderr.trim().to_string(),
            });
        }

        let limit = SCROLLBACK_LINES.to_string();
        if let Err(e) = self
            .container
            .exec(&[
                "tmux",
                "set-option",
                "-t",
                &tty.tmux_name,
                "history-limit",
                &limit,
            ])
            .await
        {
            tracing::debug!(slot = tty.id, "set history-limit failed: {e}");
        }
        Ok(())
    }

    /// Pipe raw pane output (escapes included) into the `raw` file. The data
    /// repo is mounted at the same path inside the container, so the pipe
    /// target is valid on both sides.
    async fn setup_pipe(&self, tty: &Tty) -> Result<(), KernelError> {
        let dir = tty.dir.display().to_string();
        self.container.exec(&["mkdir", "-p", &dir]).await?;

        // Close any existing pipe, then start a fresh one.
        self.container
            .exec(&["tmux", "pipe-pane", "-t", &tty.tmux_name])
            .await?;
        let pipe_cmd = format!("cat >> {dir}/raw");
        self.container
            .exec(&["tmux", "pipe-pane", "-t", &tty.tmux_name, &pipe_cmd])
            .await?;

        let raw = tty.dir.join("raw");
        if !raw.exists() {
            let _ = std::fs::write(&raw, "");
        }
        Ok(())
    }

    // ── Registry / stale detection ───────────────────────

    fn registry_file(&self) -> PathBuf {
        self.sessions_dir.join("registry.json")
    }

    /// Flush terminal metadata so out-of-process consumers observe a
    /// consistent view after every lifecycle transition.
    fn save_registry(&self, inner: &Inner) {
        let mut registry: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for tty in inner.ttys.values() {
            registry.insert(
                tty.tmux_name.clone(),
                RegistryEntry {
                    command: tty.command.clone(),
                    current_command: if tty.current_command.is_empty() {
                        tty.command.clone()
                    } else {
                        tty.current_command.clone()
                    },
                    created: tty.created.clone(),
                    status: status_line(tty),
                    last_activity: crate::logging::utc_timestamp(),
                },
            );
        }
        if let Err(e) = write_atomic(&self.registry_file(), &facet_json::to_string(&registry).unwrap_or_default()) {
            tracing::error!("failed to save terminal registry: {e}");
        }
    }

    fn load_registry(&self) -> BTreeMap<String, RegistryEntry> {
        let Ok(contents) = std::fs::read_to_string(self.registry_file()) else {
            return BTreeMap::new();
        };
        facet_json::from_str(&contents).unwrap_or_default()
    }

    /// Compare the on-disk registry against live tmux sessions. Entries whose
    /// session is gone (container restarted) are reported as lost: their
    /// scrollback is kept as `scrollback.prev`, the directory archived.
    /// Orphan tty_* directories are archived too.
    async fn detect_stale(&self) {
        let registry = self.load_registry();
        let mut stale = Vec::new();

        for (name, meta) in &registry {
            if self.session_exists(name).await {
                tracing::info!(%name, "terminal survived (tmux still alive)");
                continue;
            }
            tracing::info!(%name, "terminal lost (tmux session gone)");

            let tty_dir = self.sessions_dir.join(name);
            let scrollback = tty_dir.join("scrollback");
            let has_scrollback = scrollback.exists();
            if has_scrollback {
                let _ = std::fs::rename(&scrollback, tty_dir.join("scrollback.prev"));
            }

            stale.push(LostTty {
                name: name.clone(),
                command: meta.command.clone(),
                has_scrollback,
            });
            archive_tty_dir(&self.archive_dir, &tty_dir, self.tick_number);
        }

        // Orphan directories: tty_* on disk, absent from the registry, with
        // no live session.
        if let Ok(entries) = std::fs::read_dir(&self.sessions_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !path.is_dir() || !name.starts_with("tty_") || registry.contains_key(name) {
                    continue;
                }
                if self.session_exists(name).await {
                    continue;
                }
                tracing::info!(name, "archiving orphan terminal directory");
                archive_tty_dir(&self.archive_dir, &path, self.tick_number);
            }
        }

        if !stale.is_empty() {
            let _ = std::fs::remove_file(self.registry_file());
            self.inner.lock().await.stale = stale;
        }
    }

    // ── Login support ────────────────────────────────────

    /// Sections for the login report: slot 0's startup output in full (the
    /// agent needs it unelided), other slots as normal diffs. Marks all
    /// output seen so the first type() isn't rejected.
    pub async fn startup_report(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let mut sections = Vec::new();

        if let Some(tty0) = inner.ttys.get(&0) {
            let lines = tty0.new_lines();
            if !lines.is_empty() {
                sections.push(lines.join("\n"));
            }
        }

        let others: Vec<usize> = inner.ttys.keys().copied().filter(|id| *id != 0).collect();
        if !others.is_empty() {
            let mut parts = Vec::new();
            for id in others {
                let tty = &inner.ttys[&id];
                let lines = tty.new_lines();
                if lines.is_empty() {
                    parts.push(format!("[tty {id}: {}] no change", tty.label()));
                } else {
                    parts.push(format_diff(tty, lines, ""));
                }
            }
            sections.push(parts.join("\n"));
        }

        for tty in inner.ttys.values_mut() {
            tty.mark_seen();
        }
        sections
    }
}

#[cfg(test)]
impl TtyManager {
    /// Place a terminal directly into the registry, bypassing tmux.
    pub(crate) async fn insert_for_test(&self, tty: Tty) {
        let mut inner = self.inner.lock().await;
        inner.ttys.insert(tty.id, tty);
    }

    pub(crate) fn make_tty(&self, id: usize) -> Tty {
        Tty::new(id, &self.sessions_dir)
    }
}

// ── Pure helpers ─────────────────────────────────────────

fn status_line(tty: &Tty) -> String {
    if tty.process_dead {
        match tty.exit_code {
            Some(code) => format!("exited ({code})"),
            None => "exited".into(),
        }
    } else {
        "idle".into()
    }
}

fn write_status_file(tty: &Tty) {
    if let Err(e) = std::fs::write(tty.dir.join("status"), format!("{}\n", status_line(tty))) {
        tracing::debug!(slot = tty.id, "write status failed: {e}");
    }
}

/// Truncate the raw stream once it exceeds the size cap. The scrollback file
/// keeps the useful history; raw exists for escape-sequence forensics.
fn rotate_raw_if_needed(tty: &Tty) {
    let raw = tty.dir.join("raw");
    let Ok(meta) = std::fs::metadata(&raw) else {
        return;
    };
    if meta.len() > RAW_MAX_BYTES {
        let _ = std::fs::write(&raw, "");
    }
}

/// How many lines fell off the top of a full capture buffer. When the buffer
/// slides, the new first line appears somewhere in the old buffer; verify a
/// few following lines to avoid false matches on repeated content.
pub(crate) fn detect_buffer_shift(old_lines: &[String], new_lines: &[String]) -> usize {
    if old_lines.is_empty() || new_lines.is_empty() {
        return new_lines.len();
    }
    let target = &new_lines[0];
    for (i, line) in old_lines.iter().enumerate() {
        if line == target {
            let verify = 5.min(new_lines.len()).min(old_lines.len() - i);
            if (1..verify).all(|j| new_lines[j] == old_lines[i + j]) {
                return i;
            }
        }
    }
    // No overlap: the entire buffer is new (massive output burst)
    new_lines.len()
}

/// Render one terminal's diff, eliding the middle of long output.
fn format_diff(tty: &Tty, new_lines: &[String], prefix: &str) -> String {
    let count = new_lines.len();
    let label = tty.label();
    let id = tty.id;

    let mut header = format!("[tty {id}: {label}]");
    if !prefix.is_empty() {
        header.push_str(&format!(" {prefix},"));
    }

    if count <= INLINE_THRESHOLD {
        let plural = if count == 1 { "" } else { "s" };
        header.push_str(&format!(" {count} new line{plural}:"));
        let content: Vec<String> = new_lines.iter().map(|l| format!("  {l}")).collect();
        format!("{header}\n{}", content.join("\n"))
    } else {
        header.push_str(&format!(" {count} new lines:"));
        let head: Vec<String> = new_lines[..ELISION_HEAD]
            .iter()
            .map(|l| format!("  {l}"))
            .collect();
        let tail: Vec<String> = new_lines[count - ELISION_TAIL..]
            .iter()
            .map(|l| format!("  {l}"))
            .collect();
        let omitted = count - ELISION_HEAD - ELISION_TAIL;
        format!(
            "{header}\n{}\n  ... ({omitted} lines omitted — full scrollback: {}) ...\n{}",
            head.join("\n"),
            tty.scrollback_file().display(),
            tail.join("\n")
        )
    }
}

/// Status summary over all terminals. Every terminal is reported — ones with
/// no new output say so. Marks reported output as seen.
fn build_status_summary(ttys: &mut BTreeMap<usize, Tty>) -> String {
    if ttys.is_empty() {
        return String::new();
    }

    let mut parts = Vec::new();
    for tty in ttys.values_mut() {
        let new_lines: Vec<String> = tty.new_lines().to_vec();
        if tty.process_dead {
            let exit_str = match tty.exit_code {
                Some(code) => format!("process exited (code {code})"),
                None => "process exited".into(),
            };
            if new_lines.is_empty() {
                parts.push(format!(
                    "[tty {}: {}] {exit_str}, no new output",
                    tty.id,
                    tty.label()
                ));
            } else {
                parts.push(format_diff(tty, &new_lines, &exit_str));
            }
            tty.mark_seen();
        } else if new_lines.is_empty() {
            parts.push(format!("[tty {}: {}] no change", tty.id, tty.label()));
        } else {
            parts.push(format_diff(tty, &new_lines, ""));
            tty.mark_seen();
        }
    }
    parts.join("\n")
}

/// Minimal shell escaping: wrap in single quotes, escape embedded quotes.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Move a terminal directory into the archive, named by tick number. Name
/// collisions get a numeric suffix; the raw file is dropped (large, not
/// useful for reference).
fn archive_tty_dir(archive_dir: &Path, tty_dir: &Path, tick: u64) {
    if !tty_dir.exists() {
        return;
    }
    let Some(name) = tty_dir.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(archive_dir) {
        tracing::warn!("archive dir creation failed ({e}), removing {name}");
        let _ = std::fs::remove_dir_all(tty_dir);
        return;
    }

    let base = format!("{name}-tick-{tick:03}");
    let mut dest = archive_dir.join(&base);
    let mut suffix = 0;
    while dest.exists() {
        suffix += 1;
        dest = archive_dir.join(format!("{base}-{suffix}"));
    }

    let raw = tty_dir.join("raw");
    if raw.exists() {
        let _ = std::fs::remove_file(&raw);
    }
    if let Err(e) = std::fs::rename(tty_dir, &dest) {
        tracing::warn!("archive of {name} failed ({e}), removing");
        let _ = std::fs::remove_dir_all(tty_dir);
    }
}
