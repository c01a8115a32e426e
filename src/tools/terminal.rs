//! Terminal tool handlers — open, type, wait, close.
//!
//! Two invariants guard `type`:
//!   observe-before-act — rejected while any terminal has unobserved output;
//!   point-and-call — the caller names the program it believes is running,
//!   and a mismatch with the detected foreground command is rejected.

use crate::tty::is_key_token;

use super::{ToolArgs, ToolHost, ToolOutput};

const DEFAULT_WAIT_SECS: u64 = 30;

fn require_login(host: &ToolHost) -> Option<ToolOutput> {
    if host.is_logged_in() {
        None
    } else {
        Some(ToolOutput::error(
            "You must call login() first before using terminal tools.",
        ))
    }
}

pub async fn open(host: &ToolHost, args: &ToolArgs) -> ToolOutput {
    if let Some(err) = require_login(host) {
        return err;
    }
    let command = args.command.as_deref().unwrap_or("bash");

    match host.tty.open_lowest(command).await {
        Ok((slot, remaining)) => ToolOutput::text(format!(
            "Opened terminal {slot} ({command}). {remaining} more available."
        )),
        Err(e) => ToolOutput::error(e.to_string()),
    }
}

pub async fn type_keys(host: &ToolHost, args: &ToolArgs) -> ToolOutput {
    if let Some(err) = require_login(host) {
        return err;
    }

    let slot = args.tty.unwrap_or(0) as usize;
    if args.text.is_empty() {
        return ToolOutput::error("text is required");
    }
    if args.expect.is_empty() {
        return ToolOutput::error(
            "expect is required — state what command you think is running in this terminal",
        );
    }

    // Observe-before-act: no new input while anything is unobserved.
    if host.tty.has_unseen().await {
        return ToolOutput::error(
            "Terminals have unseen output. Call wait() first to observe output before \
             sending more input.",
        );
    }

    // Terminals are created by login() or open(), never implicitly.
    let Some(actual) = host.tty.label_of(slot).await else {
        return ToolOutput::error(format!(
            "Terminal {slot} does not exist. Use open() to create a new terminal."
        ));
    };

    // Point-and-call: the stated expectation must match reality.
    if !args.expect.eq_ignore_ascii_case(&actual) {
        return ToolOutput::error(format!(
            "Point-and-call mismatch: you expected '{}' but terminal {slot} is running \
             '{actual}'. Check which terminal you meant to use.",
            args.expect
        ));
    }

    if let Err(e) = host.tty.send_keys(slot, &args.text).await {
        return ToolOutput::error(e.to_string());
    }

    // Literal text gets a trailing Enter unless suppressed. Key tokens imply
    // suppression regardless of the enter flag.
    if !is_key_token(&args.text) && args.enter.unwrap_or(true) {
        if let Err(e) = host.tty.send_keys(slot, "Enter").await {
            return ToolOutput::error(e.to_string());
        }
    }

    host.tty.confirm_label(slot, &args.expect).await;
    ToolOutput::text("Keystrokes sent.")
}

pub async fn wait(host: &ToolHost, args: &ToolArgs) -> ToolOutput {
    if let Some(err) = require_login(host) {
        return err;
    }
    let timeout = args.timeout.unwrap_or(DEFAULT_WAIT_SECS);
    let summary = host.tty.wait_for_activity(timeout, true).await;
    ToolOutput::text(summary)
}

pub async fn close(host: &ToolHost, args: &ToolArgs) -> ToolOutput {
    if let Some(err) = require_login(host) {
        return err;
    }
    let slot = args.tty.unwrap_or(0) as usize;
    if host.tty.close(slot).await {
        ToolOutput::text(format!("Terminal {slot} closed and archived."))
    } else {
        ToolOutput::error(format!("Terminal {slot} not found."))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::container::ContainerHandle;
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
    async fn tools_require_login_first() {
        let (_dir, host) = host();
        let args = ToolArgs::default();

        for name in ["open", "type", "wait", "close"] {
            let out = host.dispatch(name, &args).await;
            assert!(out.is_error, "{name} must require login");
            assert!(out.text.contains("login()"));
        }
    }

    #[tokio::test]
    async fn type_validates_arguments() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        let out = type_keys(&host, &ToolArgs::default()).await;
        assert!(out.is_error);
        assert!(out.text.contains("text is required"));

        let out = type_keys(
            &host,
            &ToolArgs {
                text: "ls".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(out.is_error);
        assert!(out.text.contains("expect is required"));
    }

    #[tokio::test]
    async fn type_rejects_missing_terminal() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        let out = type_keys(
            &host,
            &ToolArgs {
                tty: Some(3),
                expect: "bash".into(),
                text: "ls".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(out.is_error);
        assert!(out.text.contains("Terminal 3 does not exist"));
    }

    #[tokio::test]
    async fn type_enforces_observe_before_act() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        let mut tty = host.tty.make_tty(0);
        tty.lines = vec!["surprise output".into()];
        host.tty.insert_for_test(tty).await;

        let out = type_keys(
            &host,
            &ToolArgs {
                tty: Some(0),
                expect: "bash".into(),
                text: "ls".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(out.is_error);
        assert!(out.text.contains("unseen output"));
        assert!(out.text.contains("wait()"));
    }

    #[tokio::test]
    async fn type_enforces_point_and_call() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        let mut tty = host.tty.make_tty(0);
        tty.current_command = "python3".into();
        host.tty.insert_for_test(tty).await;

        let out = type_keys(
            &host,
            &ToolArgs {
                tty: Some(0),
                expect: "bash".into(),
                text: "ls".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(out.is_error);
        assert!(out.text.contains("Point-and-call mismatch"));
        assert!(out.text.contains("python3"));
    }

    #[tokio::test]
    async fn wait_zero_timeout_returns_accumulated_immediately() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        let mut tty = host.tty.make_tty(1);
        tty.lines = vec!["pending line".into()];
        host.tty.insert_for_test(tty).await;

        let out = wait(
            &host,
            &ToolArgs {
                timeout: Some(0),
                ..Default::default()
            },
        )
        .await;
        assert!(!out.is_error);
        assert!(out.text.contains("1 new line"));
        assert!(out.text.contains("  pending line"));

        // Marks advanced with the snapshot: nothing unseen remains.
        assert!(!host.tty.has_unseen().await);
    }

    #[tokio::test]
    async fn twenty_first_terminal_hits_capacity() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        for slot in 0..20 {
            let tty = host.tty.make_tty(slot);
            host.tty.insert_for_test(tty).await;
        }

        let out = open(&host, &ToolArgs::default()).await;
        assert!(out.is_error);
        assert!(out.text.contains("Terminal limit reached (20)"));
    }

    #[tokio::test]
    async fn close_of_unknown_terminal_errors() {
        let (_dir, host) = host();
        host.set_logged_in(true);

        let out = close(
            &host,
            &ToolArgs {
                tty: Some(9),
                ..Default::default()
            },
        )
        .await;
        assert!(out.is_error);
        assert!(out.text.contains("Terminal 9 not found"));
    }

    #[tokio::test]
    async fn unknown_tool_rejected() {
        let (_dir, host) = host();
        let out = host.dispatch("bash", &ToolArgs::default()).await;
        assert!(out.is_error);
        assert!(out.text.contains("unknown tool"));
    }
}
