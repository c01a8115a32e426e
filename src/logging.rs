use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

// Retention policy for per-process log files.
const DAILY_KEEP: usize = 14;
const CURRENT_MAX_BYTES: u64 = 5 * 1024 * 1024;
const CURRENT_KEEP: usize = 5;

// ── Rotating process log ─────────────────────────────────

/// Two files per process under `system/logs/`:
///   `{process}.log`          — rotated daily to `{process}.log.YYYY-MM-DD`,
///                              14 days kept
///   `{process}-current.log`  — capped at 5 MB, numbered backups kept
struct RotatingLog {
    dir: PathBuf,
    process: String,
    day: String,
    daily: File,
    current: File,
    current_len: u64,
}

impl RotatingLog {
    fn open(dir: &Path, process: &str) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let daily_path = dir.join(format!("{process}.log"));
        let current_path = dir.join(format!("{process}-current.log"));
        let daily = OpenOptions::new().create(true).append(true).open(&daily_path)?;
        let current = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current_path)?;
        let current_len = current.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            dir: dir.to_path_buf(),
            process: process.to_string(),
            day: utc_date(),
            daily,
            current,
            current_len,
        })
    }

    fn daily_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.process))
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}-current.log", self.process))
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rotate_daily_if_needed();
        self.rotate_current_if_needed();
        self.daily.write_all(buf)?;
        self.current.write_all(buf)?;
        self.current_len += buf.len() as u64;
        Ok(buf.len())
    }

    /// On a UTC day change, move `{process}.log` aside under the previous
    /// day's suffix and prune beyond the retention window.
    fn rotate_daily_if_needed(&mut self) {
        let today = utc_date();
        if today == self.day {
            return;
        }
        let path = self.daily_path();
        let rotated = self.dir.join(format!("{}.log.{}", self.process, self.day));
        let _ = fs::rename(&path, &rotated);
        if let Ok(f) = OpenOptions::new().create(true).append(true).open(&path) {
            self.daily = f;
        }
        self.day = today;
        prune_daily(&self.dir, &self.process, DAILY_KEEP);
    }

    fn rotate_current_if_needed(&mut self) {
        if self.current_len < CURRENT_MAX_BYTES {
            return;
        }
        let path = self.current_path();
        // Shift numbered backups: .4 → .5, ..., then live file → .1
        let backup = |n: usize| self.dir.join(format!("{}-current.log.{n}", self.process));
        let _ = fs::remove_file(backup(CURRENT_KEEP));
        for n in (1..CURRENT_KEEP).rev() {
            let _ = fs::rename(backup(n), backup(n + 1));
        }
        let _ = fs::rename(&path, backup(1));
        if let Ok(f) = OpenOptions::new().create(true).append(true).open(&path) {
            self.current = f;
            self.current_len = 0;
        }
    }
}

/// Delete dated rotations beyond `keep`, oldest first (the date suffix sorts
/// chronologically).
fn prune_daily(dir: &Path, process: &str, keep: usize) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let prefix = format!("{process}.log.");
    let mut rotated: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.starts_with(&prefix))
        })
        .collect();
    rotated.sort();
    if rotated.len() > keep {
        for old in &rotated[..rotated.len() - keep] {
            let _ = fs::remove_file(old);
        }
    }
}

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that initially discards writes, then logs to rotating
/// process files once activated via `handle.activate(dir, process)`.
///
/// This lets us install the tracing subscriber at program start (before the
/// instance's data directory is known) and attach file logging later.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<RotatingLog>>>,
}

/// Handle returned by `DeferredFileWriter::new()` — call `activate`.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<RotatingLog>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Activate file logging under `dir` for the named process.
    pub fn activate(&self, dir: &Path, process: &str) -> std::io::Result<()> {
        let log = RotatingLog::open(dir, process)?;
        *self.inner.lock().unwrap() = Some(log);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<RotatingLog>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(ref mut log) = *guard {
            log.write(buf)
        } else {
            Ok(buf.len()) // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(ref mut log) = *guard {
            log.daily.flush()?;
            log.current.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── Timestamp helpers ────────────────────────────────────

/// Format the current UTC time as `YYYY-MM-DDTHH:MM:SS` without any
/// external datetime dependency.
pub fn utc_timestamp() -> String {
    let (y, m, d, hh, mm, ss) = civil_now();
    format!("{y:04}-{m:02}-{d:02}T{hh:02}:{mm:02}:{ss:02}")
}

/// Current UTC date as `YYYY-MM-DD`.
pub fn utc_date() -> String {
    let (y, m, d, _, _, _) = civil_now();
    format!("{y:04}-{m:02}-{d:02}")
}

fn civil_now() -> (i64, u64, u64, u64, u64, u64) {
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();

    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Algorithm from Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    (y, m, d, hours, minutes, seconds)
}
