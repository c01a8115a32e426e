//! The login tool and kernel-side tick-end checks.
//!
//! login() reports terminals lost to a container restart, launches the
//! startup terminals declared in the data repo, and returns their output.
//! There is no logout tool — the tick engine checks end conditions itself.

use crate::config::load_startup;

use super::{ToolHost, ToolOutput};

const STARTUP_WAIT_SECS: u64 = 15;

/// Log in: report lost terminals, launch startup terminals, return output.
/// Re-login (after the agent lost track mid-tick) closes whatever is open
/// and starts fresh.
pub async fn login(host: &ToolHost) -> ToolOutput {
    host.set_logged_in(true);

    let mut sections: Vec<String> = Vec::new();

    let existing = host.tty.slots().await;
    if !existing.is_empty() {
        host.tty.close_all().await;
    }

    let lost = host.tty.take_lost().await;
    if !lost.is_empty() {
        let mut lines = vec!["Lost TTYs (container restarted):".to_string()];
        for tty in &lost {
            let note = if tty.has_scrollback {
                " (scrollback saved to scrollback.prev)"
            } else {
                ""
            };
            lines.push(format!("  - {} ({}){note}", tty.name, tty.command));
        }
        sections.push(lines.join("\n"));
    }

    if let Some(build_error) = host.tty.take_build_error().await {
        sections.push(format!(
            "Container image rebuild FAILED (your Containerfile changes did not take \
             effect):\n  {build_error}\nFix system/container/Containerfile and it will \
             retry next tick."
        ));
    }

    match launch_startup(host).await {
        Ok(startup_sections) => sections.extend(startup_sections),
        Err(e) => sections.push(format!("(terminal setup error: {e})")),
    }

    ToolOutput::text(sections.join("\n\n"))
}

/// Open each startup terminal, type its command into the shell, then wait
/// once for everything to settle and report per-terminal output. Entries
/// without a slot are opened in the lowest free slot, same as open().
async fn launch_startup(host: &ToolHost) -> Result<Vec<String>, crate::error::KernelError> {
    let mut entries = load_startup(host.data());
    entries.sort_by_key(|e| e.slot);

    for entry in &entries {
        match entry.slot {
            Some(slot) => {
                let slot = slot as usize;
                host.tty.get_or_create(slot, "bash").await?;
                if !entry.command.is_empty() && entry.command != "bash" {
                    host.tty.send_keys(slot, &entry.command).await?;
                    host.tty.send_keys(slot, "Enter").await?;
                }
            }
            None => {
                let command = if entry.command.is_empty() {
                    "bash"
                } else {
                    entry.command.as_str()
                };
                host.tty.open_lowest(command).await?;
            }
        }
    }

    host.tty.wait_for_activity(STARTUP_WAIT_SECS, false).await;
    Ok(host.tty.startup_report().await)
}

/// Kernel-level conditions for ending the tick. Returns blocking issues;
/// empty means the kernel is satisfied. The pre-stop hooks add their own.
pub async fn tick_end_issues(host: &ToolHost) -> Vec<String> {
    let mut issues = Vec::new();

    if !host.is_logged_in() {
        issues.push(
            "You haven't called login() yet. Call login() first to get your situational \
             awareness."
                .to_string(),
        );
        return issues;
    }

    let open = host.tty.slots().await;
    if !open.is_empty() {
        let list = open
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        issues.push(format!(
            "Open TTYs: {list}. Close them with close(tty=N) or exit the shell."
        ));
    }

    issues
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::container::ContainerHandle;
    use crate::tools::ToolHost;
    use crate::tty::TtyManager;

    fn host() -> (tempfile::TempDir, ToolHost) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(TtyManager::new(
            dir.path(),
            1,
            ContainerHandle::new("tock-test".into()),
        ));
        let host = ToolHost::new(manager, dir.path());
        (dir, host)
    }

    #[tokio::test]
    async fn end_blocked_until_login() {
        let (_dir, host) = host();
        let issues = tick_end_issues(&host).await;
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("login()"));
    }

    #[tokio::test]
    async fn end_clear_after_login_with_no_terminals() {
        let (_dir, host) = host();
        host.set_logged_in(true);
        assert!(tick_end_issues(&host).await.is_empty());
    }

    #[tokio::test]
    async fn startup_entry_without_slot_allocates_lowest_free() {
        let (dir, host) = host();
        std::fs::create_dir_all(crate::paths::system_dir(dir.path())).unwrap();
        std::fs::write(
            crate::paths::startup_file(dir.path()),
            r#"[{"command": "python3"}]"#,
        )
        .unwrap();

        // With every slot taken, a slot-less entry must go through the
        // lowest-free-slot allocator and hit capacity — not be dropped.
        for slot in 0..crate::tty::MAX_TTYS {
            let tty = host.tty.make_tty(slot);
            host.tty.insert_for_test(tty).await;
        }

        let err = launch_startup(&host).await.unwrap_err();
        assert!(err.to_string().contains("Terminal limit reached"));
    }
}
