use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::KernelError;
use crate::util::write_atomic;

/// One registered instance: a short name mapped to its data repo.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct InstanceInfo {
    #[facet(default)]
    pub path: String,
    #[facet(default)]
    pub remote: String,
    #[facet(default)]
    pub created: String,
}

/// Instance registry persisted as `instances.json` under the per-user config
/// directory. Name → data repo path, plus provenance.
pub struct Registry {
    file: PathBuf,
}

impl Registry {
    /// Registry at the default per-user location.
    pub fn open_default() -> Self {
        Self {
            file: crate::paths::registry_file(),
        }
    }

    /// Registry backed by an explicit file (tests).
    pub fn at(file: PathBuf) -> Self {
        Self { file }
    }

    pub fn load(&self) -> BTreeMap<String, InstanceInfo> {
        let Ok(contents) = std::fs::read_to_string(&self.file) else {
            return BTreeMap::new();
        };
        facet_json::from_str(&contents).unwrap_or_default()
    }

    fn save(&self, registry: &BTreeMap<String, InstanceInfo>) -> Result<(), KernelError> {
        write_atomic(&self.file, &facet_json::to_string(registry).unwrap_or_default())
    }

    pub fn register(
        &self,
        name: &str,
        path: &Path,
        remote: Option<&str>,
    ) -> Result<(), KernelError> {
        validate_name(name)?;
        let mut registry = self.load();
        registry.insert(
            name.to_string(),
            InstanceInfo {
                path: path.display().to_string(),
                remote: remote.unwrap_or_default().to_string(),
                created: crate::logging::utc_timestamp(),
            },
        );
        self.save(&registry)
    }

    /// Returns false if the name wasn't registered.
    pub fn unregister(&self, name: &str) -> Result<bool, KernelError> {
        let mut registry = self.load();
        let removed = registry.remove(name).is_some();
        if removed {
            self.save(&registry)?;
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<InstanceInfo> {
        self.load().get(name).cloned()
    }

    /// Resolve a name to its data directory. Registered names win; otherwise
    /// an existing directory path is accepted as an ad-hoc instance.
    pub fn resolve(&self, name_or_path: &str) -> Option<PathBuf> {
        if let Some(info) = self.load().get(name_or_path) {
            return Some(PathBuf::from(&info.path));
        }
        let p = PathBuf::from(name_or_path);
        if p.is_dir() {
            return p.canonicalize().ok();
        }
        None
    }
}

/// Instance names become container names and systemd unit names, so keep
/// them to a safe character set.
pub fn validate_name(name: &str) -> Result<(), KernelError> {
    let valid = !name.is_empty()
        && name.chars().next().unwrap().is_ascii_alphanumeric()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(KernelError::Validation {
            message: format!(
                "instance name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::at(dir.path().join("instances.json"));
        (dir, registry)
    }

    #[test]
    fn register_and_resolve() {
        let (dir, registry) = test_registry();
        let data = dir.path().join("pet");
        std::fs::create_dir_all(&data).unwrap();

        registry
            .register("pet", &data, Some("git@example.com:pet.git"))
            .unwrap();

        assert_eq!(registry.resolve("pet"), Some(data.clone()));
        let info = registry.get("pet").unwrap();
        assert_eq!(info.remote, "git@example.com:pet.git");
        assert!(!info.created.is_empty());
    }

    #[test]
    fn resolve_falls_back_to_existing_path() {
        let (dir, registry) = test_registry();
        let data = dir.path().join("adhoc");
        std::fs::create_dir_all(&data).unwrap();

        let resolved = registry.resolve(data.to_str().unwrap()).unwrap();
        assert_eq!(resolved, data.canonicalize().unwrap());
    }

    #[test]
    fn resolve_unknown_is_none() {
        let (_dir, registry) = test_registry();
        assert!(registry.resolve("nope").is_none());
        assert!(registry.resolve("/nonexistent/path/xyz").is_none());
    }

    #[test]
    fn unregister_removes_entry() {
        let (dir, registry) = test_registry();
        let data = dir.path().join("pet");
        std::fs::create_dir_all(&data).unwrap();
        registry.register("pet", &data, None).unwrap();

        assert!(registry.unregister("pet").unwrap());
        assert!(!registry.unregister("pet").unwrap());
        assert!(registry.resolve("pet").is_none());
    }

    #[test]
    fn malformed_registry_reads_as_empty() {
        let (dir, registry) = test_registry();
        std::fs::write(dir.path().join("instances.json"), "{broken").unwrap();
        assert!(registry.load().is_empty());
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["", "-bad", ".bad", "a/b", "has space", "inj<ect>"] {
            assert!(validate_name(name).is_err(), "expected '{name}' rejected");
        }
        for name in ["pet", "my-agent", "a.b_c", "X1"] {
            validate_name(name).unwrap();
        }
    }
}
