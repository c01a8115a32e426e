//! The agent's tool surface.
//!
//! Deliberately minimal: five tools. `login` starts the workstation,
//! `open`/`type`/`wait`/`close` drive terminals. Everything else the agent
//! does goes through the provider's built-in file tools against the session
//! files the capture loop maintains.

pub mod login;
pub mod terminal;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use facet::Facet;

use crate::tty::TtyManager;

/// Superset of the five tools' arguments. The surface is a closed
/// enumeration, so one tolerant argument struct covers every call.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ToolArgs {
    pub tty: Option<u64>,
    #[facet(default)]
    pub expect: String,
    #[facet(default)]
    pub text: String,
    pub enter: Option<bool>,
    pub command: Option<String>,
    pub timeout: Option<u64>,
}

/// A tool result handed back to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: format!("Error: {}", text.into()),
            is_error: true,
        }
    }
}

/// One tool advertised to the session provider.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema for the arguments, passed through verbatim.
    pub input_schema: &'static str,
}

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "login",
            description: "Log in to your workstation. Call this FIRST at the start of every \
                          tick. Returns startup output.",
            input_schema: r#"{"type": "object", "properties": {}}"#,
        },
        ToolDefinition {
            name: "open",
            description: "Open a new terminal. Use this to run things in parallel — long \
                          builds, background servers, separate interactive sessions. Returns \
                          the terminal number to use with type() and close(). Default command \
                          is bash. Pass a command to launch it directly (e.g. \
                          open(command=\"python3\")).",
            input_schema: r#"{"type": "object", "properties": {"command": {"type": "string"}}}"#,
        },
        ToolDefinition {
            name: "type",
            description: "Send keystrokes to a terminal. For literal text, just pass the \
                          string — Enter is sent automatically after literal text. For control \
                          characters, use key name syntax: \"Enter\" for return, \"C-c\" for \
                          Ctrl-C, \"C-d\" for EOF, \"Tab\" for tab, \"Up\"/\"Down\" for arrow \
                          keys (key tokens never get a trailing Enter). You must specify \
                          `expect` — the command you believe is currently running in this \
                          terminal (e.g. \"bash\", \"python3\"). The tool fails if the actual \
                          running command doesn't match, preventing keystrokes sent to the \
                          wrong process. This tool also fails if any terminal has unseen \
                          output: call wait() first to observe output before sending more \
                          input.",
            input_schema: r#"{"type": "object", "properties": {"tty": {"type": "integer"}, "expect": {"type": "string"}, "text": {"type": "string"}, "enter": {"type": "boolean"}}, "required": ["tty", "expect", "text"]}"#,
        },
        ToolDefinition {
            name: "wait",
            description: "Wait for terminal output to settle, then return a summary of all \
                          terminals. This is the only way to observe terminal output. After \
                          sending input with type(), call wait() to see what happened. Blocks \
                          until output settles (no new output for ~1.5s) or the timeout \
                          expires (default 30s, max 60s). Short output is shown inline; long \
                          output shows head/tail with full content in the scrollback file. To \
                          see the current screen: Read(\"tmp/sessions/tty_N/screen\"). To read \
                          full output: Read(\"tmp/sessions/tty_N/scrollback\").",
            input_schema: r#"{"type": "object", "properties": {"timeout": {"type": "integer"}}}"#,
        },
        ToolDefinition {
            name: "close",
            description: "Force-close a terminal. Kills the running process (if any), archives \
                          the scrollback, and removes the terminal. Use this when a process is \
                          stuck and can't be exited normally, or to clean up terminals you're \
                          done with. All terminals must be closed before the tick can end.",
            input_schema: r#"{"type": "object", "properties": {"tty": {"type": "integer"}}, "required": ["tty"]}"#,
        },
    ]
}

/// Shared state behind the tool surface for one tick. Nothing outside the
/// tick engine mutates the terminal manager.
pub struct ToolHost {
    pub tty: Arc<TtyManager>,
    data: PathBuf,
    logged_in: AtomicBool,
}

impl ToolHost {
    pub fn new(tty: Arc<TtyManager>, data: &Path) -> Self {
        Self {
            tty,
            data: data.to_path_buf(),
            logged_in: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &Path {
        &self.data
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub(crate) fn set_logged_in(&self, value: bool) {
        self.logged_in.store(value, Ordering::SeqCst);
    }

    /// Route one tool call to its handler. Unknown names are rejected as
    /// structured tool errors; the model is expected to recover.
    pub async fn dispatch(&self, name: &str, args: &ToolArgs) -> ToolOutput {
        match name {
            "login" => login::login(self).await,
            "open" => terminal::open(self, args).await,
            "type" => terminal::type_keys(self, args).await,
            "wait" => terminal::wait(self, args).await,
            "close" => terminal::close(self, args).await,
            other => ToolOutput::error(format!("unknown tool '{other}'")),
        }
    }
}
