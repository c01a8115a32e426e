use std::path::Path;

use facet::Facet;

use crate::error::KernelError;
use crate::util::write_atomic;

/// Instance state persisted across ticks in `system/state.json`.
///
/// The tick counter is monotonic: it is incremented and persisted exactly
/// once per started tick, before pre-tick hooks run.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct InstanceState {
    pub tick_count: u64,
    #[facet(default)]
    pub last_tick_started: String,
    #[facet(default)]
    pub last_tick_ended: String,
    #[facet(default)]
    pub first_tick_date: String,
}

impl InstanceState {
    /// Load state from the data repo. A missing or malformed file yields the
    /// zero state — the agent gets a chance to run and repair.
    pub fn load(data: &Path) -> Self {
        let path = crate::paths::state_file(data);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match facet_json::from_str(&contents) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), "malformed state.json, starting fresh: {e}");
                Self::default()
            }
        }
    }

    /// Persist via atomic rename so concurrent readers never see a torn write.
    pub fn save(&self, data: &Path) -> Result<(), KernelError> {
        let json = facet_json::to_string(self).map_err(|e| KernelError::Validation {
            message: format!("serializing state: {e}"),
        })?;
        write_atomic(&crate::paths::state_file(data), &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_zero_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = InstanceState::load(dir.path());
        assert_eq!(state.tick_count, 0);
        assert!(state.last_tick_started.is_empty());
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let state = InstanceState {
            tick_count: 41,
            last_tick_started: "2026-08-01T10:00:00".into(),
            last_tick_ended: "2026-08-01T10:03:12".into(),
            first_tick_date: "2026-07-01".into(),
        };
        state.save(dir.path()).unwrap();

        let loaded = InstanceState::load(dir.path());
        assert_eq!(loaded.tick_count, 41);
        assert_eq!(loaded.last_tick_started, "2026-08-01T10:00:00");
        assert_eq!(loaded.last_tick_ended, "2026-08-01T10:03:12");
        assert_eq!(loaded.first_tick_date, "2026-07-01");
    }

    #[test]
    fn malformed_file_yields_zero_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::paths::state_file(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let state = InstanceState::load(dir.path());
        assert_eq!(state.tick_count, 0);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::paths::state_file(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"tick_count": 3}"#).unwrap();

        let state = InstanceState::load(dir.path());
        assert_eq!(state.tick_count, 3);
        assert!(state.last_tick_ended.is_empty());
    }
}
