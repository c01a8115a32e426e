use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use facet::Facet;

use crate::error::KernelError;

// ── Agent configuration ──────────────────────────────────

/// Per-instance tunables from `system/agent_config.json`.
///
/// Every field is optional on disk; a missing or malformed file falls back to
/// these defaults in full. Config problems are never fatal — the agent always
/// gets a chance to run and repair the file with its own tools.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AgentConfig {
    /// Model identifier; empty means the provider's default.
    #[facet(default)]
    pub model: String,
    #[facet(default = 16000)]
    pub thinking_tokens: u32,
    #[facet(default = "Tick {tick} starting. Call login() to begin.")]
    pub initial_query: String,
    #[facet(default = "AGENT")]
    pub hook_env_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            thinking_tokens: 16000,
            initial_query: "Tick {tick} starting. Call login() to begin.".into(),
            hook_env_prefix: "AGENT".into(),
        }
    }
}

pub fn load_agent_config(data: &Path) -> AgentConfig {
    let path = crate::paths::agent_config_file(data);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return AgentConfig::default();
    };
    match facet_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), "malformed agent_config.json, using defaults: {e}");
            AgentConfig::default()
        }
    }
}

// ── System prompt cache ──────────────────────────────────

/// Caches `system/prompt.md`, rebuilding only when the file's mtime changes.
/// Owned by whoever drives ticks (the watcher, or a one-shot CLI tick).
#[derive(Debug, Default)]
pub struct PromptCache {
    text: Option<String>,
    mtime: Option<SystemTime>,
}

impl PromptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, data: &Path) -> &str {
        let path = crate::paths::prompt_file(data);
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if self.text.is_none() || mtime != self.mtime {
            let text = std::fs::read_to_string(&path)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            self.text = Some(text);
            self.mtime = mtime;
        }
        self.text.as_deref().unwrap_or_default()
    }
}

// ── Sub-agent definitions ────────────────────────────────

/// One sub-agent from `system/agents.json`, forwarded verbatim to the
/// session provider.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct AgentDef {
    #[facet(default)]
    pub description: String,
    #[facet(default)]
    pub prompt: String,
    #[facet(default)]
    pub tools: Vec<String>,
    pub model: Option<String>,
}

pub fn load_agents(data: &Path) -> BTreeMap<String, AgentDef> {
    let path = crate::paths::agents_file(data);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return BTreeMap::new();
    };
    match facet_json::from_str(&contents) {
        Ok(agents) => agents,
        Err(e) => {
            tracing::warn!(path = %path.display(), "malformed agents.json, ignoring: {e}");
            BTreeMap::new()
        }
    }
}

// ── Startup terminals ────────────────────────────────────

/// One entry from `system/startup.json`: a terminal `login()` should open and
/// the command to launch in it.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct StartupEntry {
    pub slot: Option<u64>,
    #[facet(default)]
    pub command: String,
}

/// Load startup entries. Slot 0 (a bare shell) is always present: if the file
/// doesn't declare it, it is prepended. Malformed files fall back to just
/// slot 0.
pub fn load_startup(data: &Path) -> Vec<StartupEntry> {
    let default = vec![StartupEntry {
        slot: Some(0),
        command: "bash".into(),
    }];

    let path = crate::paths::startup_file(data);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return default;
    };
    let mut entries: Vec<StartupEntry> = match facet_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path.display(), "malformed startup.json, using bash only: {e}");
            return default;
        }
    };
    if !entries.iter().any(|e| e.slot == Some(0)) {
        entries.insert(
            0,
            StartupEntry {
                slot: Some(0),
                command: "bash".into(),
            },
        );
    }
    entries
}

// ── Directory skeleton ───────────────────────────────────

/// Ensure the data repo's working directories exist and wipe `tmp/` (catches
/// stale state from crashed ticks).
pub fn ensure_dirs(data: &Path) -> Result<(), KernelError> {
    for dir in [
        crate::paths::system_dir(data),
        crate::paths::notifications_dir(data),
        crate::paths::logs_dir(data),
        data.join("sandbox"),
    ] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| KernelError::io(format!("creating {}", dir.display()), e))?;
    }

    let tmp = crate::paths::tmp_dir(data);
    if tmp.exists() {
        let _ = std::fs::remove_dir_all(&tmp);
    }
    std::fs::create_dir_all(&tmp)
        .map_err(|e| KernelError::io(format!("creating {}", tmp.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_agent_config(dir.path());
        assert!(config.model.is_empty());
        assert_eq!(config.thinking_tokens, 16000);
        assert_eq!(config.hook_env_prefix, "AGENT");
        assert!(config.initial_query.contains("{tick}"));
    }

    #[test]
    fn agent_config_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        std::fs::write(
            crate::paths::agent_config_file(dir.path()),
            r#"{"model": "opus", "hook_env_prefix": "PET"}"#,
        )
        .unwrap();

        let config = load_agent_config(dir.path());
        assert_eq!(config.model, "opus");
        assert_eq!(config.hook_env_prefix, "PET");
        assert_eq!(config.thinking_tokens, 16000);
    }

    #[test]
    fn agent_config_malformed_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        std::fs::write(crate::paths::agent_config_file(dir.path()), "]]]").unwrap();

        let config = load_agent_config(dir.path());
        assert_eq!(config.hook_env_prefix, "AGENT");
    }

    #[test]
    fn prompt_cache_reloads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        let prompt_path = crate::paths::prompt_file(dir.path());
        std::fs::write(&prompt_path, "first\n").unwrap();

        let mut cache = PromptCache::new();
        assert_eq!(cache.load(dir.path()), "first");

        // Rewrite with a different mtime.
        std::fs::write(&prompt_path, "second\n").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
        let f = std::fs::OpenOptions::new()
            .append(true)
            .open(&prompt_path)
            .unwrap();
        f.set_modified(later).unwrap();
        drop(f);

        assert_eq!(cache.load(dir.path()), "second");
    }

    #[test]
    fn prompt_cache_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = PromptCache::new();
        assert_eq!(cache.load(dir.path()), "");
    }

    #[test]
    fn startup_defaults_to_bash_slot_zero() {
        let dir = tempfile::tempdir().unwrap();
        let entries = load_startup(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].slot, Some(0));
        assert_eq!(entries[0].command, "bash");
    }

    #[test]
    fn startup_prepends_slot_zero_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        std::fs::write(
            crate::paths::startup_file(dir.path()),
            r#"[{"slot": 1, "command": "python3"}]"#,
        )
        .unwrap();

        let entries = load_startup(dir.path());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].slot, Some(0));
        assert_eq!(entries[1].command, "python3");
    }

    #[test]
    fn agents_map_parses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        std::fs::write(
            crate::paths::agents_file(dir.path()),
            r#"{"scout": {"description": "explores", "prompt": "look around", "tools": ["Read"]}}"#,
        )
        .unwrap();

        let agents = load_agents(dir.path());
        assert_eq!(agents.len(), 1);
        let scout = &agents["scout"];
        assert_eq!(scout.description, "explores");
        assert_eq!(scout.tools, vec!["Read".to_string()]);
        assert!(scout.model.is_none());
    }

    #[test]
    fn ensure_dirs_wipes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let stale = crate::paths::sessions_dir(dir.path()).join("tty_0");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("raw"), "leftover").unwrap();

        ensure_dirs(dir.path()).unwrap();

        assert!(crate::paths::tmp_dir(dir.path()).exists());
        assert!(!stale.exists());
        assert!(crate::paths::notifications_dir(dir.path()).exists());
    }
}
