//! Hook runner — executes scripts from `system/hooks/{point}/` inside the
//! container, in sorted filename order.
//!
//! Hooks are fail-open: a failing or hung script is logged (and surfaced via
//! crash notification) but never stops the tick. Pre-stop hooks communicate
//! through stdout lines collected by `run_collect`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::ContainerHandle;

pub const HOOK_TIMEOUT: Duration = Duration::from_secs(60);
pub const PRE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct HookResult {
    pub script: String,
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr: String,
    pub timed_out: bool,
}

/// Executable regular files in the hook directory, sorted by name.
/// Dotfiles and editor backups (`name~`) are skipped.
pub fn discover(data: &Path, point: &str) -> Vec<PathBuf> {
    let dir = crate::paths::hooks_dir(data, point);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut scripts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            if name.starts_with('.') || name.ends_with('~') {
                return false;
            }
            p.is_file() && is_executable(p)
        })
        .collect();
    scripts.sort();
    scripts
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Hook env: always `DATA_DIR` (identical inside and outside the container),
/// plus whatever the caller provides.
pub fn build_env(data: &Path, extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut env = vec![("DATA_DIR".to_string(), data.display().to_string())];
    env.extend(extra.iter().cloned());
    env
}

async fn run_script(
    container: &ContainerHandle,
    data: &Path,
    point: &str,
    script: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> HookResult {
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let script_path = script.display().to_string();

    let out = container
        .exec_env(env, &[script_path.as_str()], timeout)
        .await;

    if out.timed_out {
        tracing::warn!(point, script = %name, "hook timed out after {}s", timeout.as_secs());
        crate::notifications::send_crash_notification(
            data,
            &format!("Hook {point}/{name} timed out after {}s", timeout.as_secs()),
        );
    } else if out.exit_code != 0 {
        let stderr = crate::util::truncate(out.stderr.trim(), 500);
        tracing::warn!(point, script = %name, "hook failed (exit {}): {stderr}", out.exit_code);
        crate::notifications::send_crash_notification(
            data,
            &format!("Hook {point}/{name} failed (exit {})\n{stderr}", out.exit_code),
        );
    } else {
        tracing::debug!(point, script = %name, "hook ok");
    }

    HookResult {
        script: name,
        exit_code: out.exit_code,
        stdout_lines: out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        stderr: out.stderr,
        timed_out: out.timed_out,
    }
}

/// Run all scripts for a hook point. Failures are logged and swallowed.
pub async fn run_hooks(
    container: &ContainerHandle,
    data: &Path,
    point: &str,
    extra_env: &[(String, String)],
    timeout: Duration,
) {
    let scripts = discover(data, point);
    if scripts.is_empty() {
        return;
    }
    let env = build_env(data, extra_env);
    for script in &scripts {
        run_script(container, data, point, script, &env, timeout).await;
    }
}

/// Run all scripts for a hook point and collect non-empty stdout lines from
/// scripts that exited 0. Failed or timed-out scripts contribute nothing
/// (fail-open: they can never block the tick from ending).
pub async fn run_collect(
    container: &ContainerHandle,
    data: &Path,
    point: &str,
    extra_env: &[(String, String)],
    timeout: Duration,
) -> Vec<String> {
    let scripts = discover(data, point);
    if scripts.is_empty() {
        return Vec::new();
    }
    let env = build_env(data, extra_env);

    let mut lines = Vec::new();
    for script in &scripts {
        let result = run_script(container, data, point, script, &env, timeout).await;
        if result.exit_code == 0 && !result.timed_out {
            lines.extend(result.stdout_lines);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_hook(data: &Path, point: &str, name: &str, executable: bool) {
        let dir = crate::paths::hooks_dir(data, point);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();
        let mode = if executable { 0o755 } else { 0o644 };
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn discover_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "pre-tick", "20-second", true);
        write_hook(dir.path(), "pre-tick", "10-first", true);
        write_hook(dir.path(), "pre-tick", ".hidden", true);
        write_hook(dir.path(), "pre-tick", "backup~", true);
        write_hook(dir.path(), "pre-tick", "not-executable", false);

        let scripts = discover(dir.path(), "pre-tick");
        let names: Vec<String> = scripts
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["10-first", "20-second"]);
    }

    #[test]
    fn discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path(), "post-tick").is_empty());
    }

    #[test]
    fn env_always_includes_data_dir() {
        let data = Path::new("/srv/agent");
        let env = build_env(
            data,
            &[("AGENT_TICK".to_string(), "7".to_string())],
        );
        assert_eq!(env[0], ("DATA_DIR".to_string(), "/srv/agent".to_string()));
        assert_eq!(env[1], ("AGENT_TICK".to_string(), "7".to_string()));
    }
}
