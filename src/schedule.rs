use std::path::Path;

use facet::Facet;

use crate::util::write_atomic;

/// One scheduled wake in `system/schedule.json`. Due when `due_at <= now`.
/// Entries are consumed exactly once: the watcher removes an entry (atomic
/// rewrite) before firing the tick it triggers.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ScheduleEntry {
    #[facet(default)]
    pub id: String,
    pub due_at: u64,
    #[facet(default)]
    pub reason: String,
}

/// Load the schedule. Missing or malformed files read as empty — the agent
/// repairs its own schedule with file tools.
pub fn load(data: &Path) -> Vec<ScheduleEntry> {
    let path = crate::paths::schedule_file(data);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match facet_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path.display(), "malformed schedule.json, ignoring: {e}");
            Vec::new()
        }
    }
}

/// Remove and return the earliest due entry, rewriting the file atomically.
/// Returns None when nothing is due.
pub fn take_due(data: &Path, now: u64) -> Option<ScheduleEntry> {
    let entries = load(data);
    let due_idx = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.due_at <= now)
        .min_by_key(|(_, e)| e.due_at)
        .map(|(i, _)| i)?;

    let mut remaining = entries;
    let taken = remaining.remove(due_idx);

    let path = crate::paths::schedule_file(data);
    if let Err(e) = write_atomic(&path, &facet_json::to_string(&remaining).unwrap_or_default()) {
        // Leave the entry in place rather than firing it twice later and
        // losing the rewrite; the next poll retries.
        tracing::warn!("failed to rewrite schedule: {e}");
        return None;
    }
    Some(taken)
}
