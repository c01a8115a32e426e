//! The session-provider boundary.
//!
//! The kernel treats the model SDK as an opaque provider of interactive
//! sessions: open a session, receive a stream of events, inject user
//! messages mid-session, answer tool calls. `CliSession` adapts the agent
//! CLI's line-delimited JSON mode (`--input-format stream-json
//! --output-format stream-json`) to that interface; anything speaking the
//! same minimal contract can replace it.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use facet::Facet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::config::AgentDef;
use crate::error::KernelError;
use crate::tools::{ToolArgs, ToolDefinition, ToolOutput};

// ── Events ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: ToolArgs,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session established; carries the provider's session id.
    Init { session_id: String },
    /// One assistant turn: text so far plus any tool calls to dispatch.
    Assistant {
        text: String,
        tool_calls: Vec<ToolCall>,
        error: Option<String>,
    },
    /// The provider finished a turn and is waiting for input.
    Result { is_error: bool, text: String },
    /// The provider is about to compact its context.
    Compacting { trigger: String },
}

// ── Options ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Empty string means the provider's default model.
    pub model: String,
    pub system_prompt: String,
    pub thinking_tokens: u32,
    pub tools: Vec<ToolDefinition>,
    pub agents: BTreeMap<String, AgentDef>,
    /// Working directory for the session; the data repo root.
    pub cwd: PathBuf,
}

// ── Traits ───────────────────────────────────────────────

pub trait Session: Send {
    /// Next event from the provider stream; None when the stream ends.
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<SessionEvent>, KernelError>> + Send;

    /// Inject a user message into the live session. Safe between events;
    /// ordering relative to an in-flight tool call is resolved provider-side.
    fn query(&mut self, text: &str) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Answer a tool call.
    fn tool_result(
        &mut self,
        call_id: &str,
        output: &ToolOutput,
    ) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// The provider's append-only transcript for this session, if known.
    fn transcript_path(&self) -> Option<PathBuf>;

    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait SessionProvider {
    type Session: Session;

    fn open(
        &self,
        options: &SessionOptions,
    ) -> impl Future<Output = Result<Self::Session, KernelError>> + Send;
}

// ── Wire format (input → kernel) ─────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireEvent {
    #[facet(rename = "type", default)]
    kind: String,
    #[facet(default)]
    subtype: String,
    #[facet(default)]
    session_id: String,
    #[facet(default)]
    message: WireMessage,
    #[facet(default)]
    error: String,
    #[facet(default)]
    is_error: bool,
    #[facet(default)]
    result: String,
    #[facet(rename = "compactMetadata", default)]
    compact_metadata: WireCompact,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireMessage {
    #[facet(default)]
    content: Vec<WireBlock>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireBlock {
    #[facet(rename = "type", default)]
    kind: String,
    #[facet(default)]
    text: String,
    #[facet(default)]
    id: String,
    #[facet(default)]
    name: String,
    #[facet(default)]
    input: ToolArgs,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct WireCompact {
    #[facet(default)]
    trigger: String,
}

/// Parse one provider line. Unknown or malformed event types are skipped
/// rather than killing the session.
pub(crate) fn parse_wire_line(line: &str) -> Option<SessionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let event: WireEvent = match facet_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!("skipping unparseable provider line: {e}");
            return None;
        }
    };

    match event.kind.as_str() {
        "system" if event.subtype == "init" => Some(SessionEvent::Init {
            session_id: event.session_id,
        }),
        "system" if event.subtype == "compact_boundary" => Some(SessionEvent::Compacting {
            trigger: event.compact_metadata.trigger,
        }),
        "assistant" => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in event.message.content {
                match block.kind.as_str() {
                    "text" => text_parts.push(block.text),
                    "tool_use" => tool_calls.push(ToolCall {
                        id: block.id,
                        name: short_tool_name(&block.name).to_string(),
                        args: block.input,
                    }),
                    _ => {}
                }
            }
            Some(SessionEvent::Assistant {
                text: text_parts.join("\n"),
                tool_calls,
                error: if event.error.is_empty() {
                    None
                } else {
                    Some(event.error)
                },
            })
        }
        "result" => Some(SessionEvent::Result {
            is_error: event.is_error,
            text: event.result,
        }),
        other => {
            tracing::debug!("ignoring provider event type '{other}'");
            None
        }
    }
}

/// Providers namespace custom tools (e.g. `mcp__agent__type`); strip down to
/// the bare name the dispatcher knows.
fn short_tool_name(name: &str) -> &str {
    name.rsplit("__").next().unwrap_or(name)
}

// ── Wire format (kernel → provider) ──────────────────────

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn user_message_line(text: &str) -> String {
    format!(
        r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"text","text":"{}"}}]}}}}"#,
        json_escape(text)
    )
}

pub(crate) fn tool_result_line(call_id: &str, output: &ToolOutput) -> String {
    format!(
        r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"{}","content":"{}","is_error":{}}}]}}}}"#,
        json_escape(call_id),
        json_escape(&output.text),
        output.is_error
    )
}

// ── CLI-backed session ───────────────────────────────────

/// Spawns the agent CLI in stream-json mode and speaks JSONL over its stdio.
pub struct CliProvider {
    binary: String,
}

impl CliProvider {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("TOCK_AGENT_BIN").unwrap_or_else(|_| "claude".into()),
        }
    }
}

impl Default for CliProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider for CliProvider {
    type Session = CliSession;

    async fn open(&self, options: &SessionOptions) -> Result<CliSession, KernelError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.current_dir(&options.cwd)
            .arg("-p")
            .args(["--input-format", "stream-json"])
            .args(["--output-format", "stream-json"])
            .arg("--verbose")
            .args(["--permission-mode", "acceptEdits"])
            .args(["--disallowed-tools", "Bash,BashOutput,KillBash"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !options.model.is_empty() {
            cmd.args(["--model", &options.model]);
        }
        if !options.system_prompt.is_empty() {
            cmd.args(["--system-prompt", &options.system_prompt]);
        }
        if options.thinking_tokens > 0 {
            cmd.env("MAX_THINKING_TOKENS", options.thinking_tokens.to_string());
        }
        if !options.agents.is_empty() {
            cmd.args([
                "--agents",
                &facet_json::to_string(&options.agents).unwrap_or_default(),
            ]);
        }

        let mut child = cmd.spawn().map_err(|e| KernelError::Provider {
            message: format!("failed to spawn {}: {e}", self.binary),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| KernelError::Provider {
            message: "provider stdin not piped".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| KernelError::Provider {
            message: "provider stdout not piped".into(),
        })?;

        // Drain stderr into the log so a wedged provider is diagnosable.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "provider", "{line}");
                }
            });
        }

        Ok(CliSession {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            session_id: String::new(),
        })
    }
}

pub struct CliSession {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    session_id: String,
}

impl CliSession {
    async fn send_line(&mut self, line: &str) -> Result<(), KernelError> {
        let write = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        };
        write.await.map_err(|e| KernelError::Provider {
            message: format!("provider stdin write failed: {e}"),
        })
    }
}

impl Session for CliSession {
    async fn next_event(&mut self) -> Result<Option<SessionEvent>, KernelError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| KernelError::Provider {
                    message: format!("provider stream read failed: {e}"),
                })?;
            let Some(line) = line else {
                return Ok(None);
            };
            if let Some(event) = parse_wire_line(&line) {
                if let SessionEvent::Init { session_id } = &event {
                    self.session_id = session_id.clone();
                }
                return Ok(Some(event));
            }
        }
    }

    async fn query(&mut self, text: &str) -> Result<(), KernelError> {
        self.send_line(&user_message_line(text)).await
    }

    async fn tool_result(&mut self, call_id: &str, output: &ToolOutput) -> Result<(), KernelError> {
        self.send_line(&tool_result_line(call_id, output)).await
    }

    /// The CLI writes transcripts under `~/.claude/projects/`; find this
    /// session's file by id.
    fn transcript_path(&self) -> Option<PathBuf> {
        if self.session_id.is_empty() {
            return None;
        }
        let projects = dirs::home_dir()?.join(".claude").join("projects");
        find_transcript(&projects, &self.session_id)
    }

    async fn shutdown(&mut self) {
        let _ = self.stdin.shutdown().await;
        match tokio::time::timeout(std::time::Duration::from_secs(10), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Scan a projects directory for `{session_id}.jsonl`.
pub(crate) fn find_transcript(projects: &Path, session_id: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(projects).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let candidate = entry.path().join(format!("{session_id}.jsonl"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

// ── Test double ──────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_event() {
        let event = parse_wire_line(
            r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#,
        )
        .unwrap();
        match event {
            SessionEvent::Init { session_id } => assert_eq!(session_id, "abc-123"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_assistant_with_text_and_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Let me check."},
            {"type":"tool_use","id":"tu_1","name":"mcp__agent__type","input":{"tty":0,"expect":"bash","text":"ls"}}
        ]}}"#
            .replace('\n', "");
        let event = parse_wire_line(&line).unwrap();
        match event {
            SessionEvent::Assistant {
                text,
                tool_calls,
                error,
            } => {
                assert_eq!(text, "Let me check.");
                assert!(error.is_none());
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].name, "type");
                assert_eq!(tool_calls[0].id, "tu_1");
                assert_eq!(tool_calls[0].args.tty, Some(0));
                assert_eq!(tool_calls[0].args.expect, "bash");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_result_and_compacting() {
        match parse_wire_line(r#"{"type":"result","is_error":true,"result":"rate limit"}"#) {
            Some(SessionEvent::Result { is_error, text }) => {
                assert!(is_error);
                assert_eq!(text, "rate limit");
            }
            other => panic!("unexpected: {other:?}"),
        }

        match parse_wire_line(
            r#"{"type":"system","subtype":"compact_boundary","compactMetadata":{"trigger":"auto"}}"#,
        ) {
            Some(SessionEvent::Compacting { trigger }) => assert_eq!(trigger, "auto"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        assert!(parse_wire_line(r#"{"type":"rate_limit_event","data":1}"#).is_none());
        assert!(parse_wire_line("not json").is_none());
        assert!(parse_wire_line("").is_none());
    }

    #[test]
    fn outgoing_lines_escape_properly() {
        let line = user_message_line("say \"hi\"\nnew line\ttab");
        assert!(line.contains(r#"\"hi\""#));
        assert!(line.contains(r"\n"));
        assert!(line.contains(r"\t"));
        // Still single-line JSONL
        assert!(!line.contains('\n'));

        let result = tool_result_line("tu_9", &ToolOutput::error("no such terminal"));
        assert!(result.contains(r#""tool_use_id":"tu_9""#));
        assert!(result.contains(r#""is_error":true"#));
    }

    #[test]
    fn short_tool_names_strip_namespaces() {
        assert_eq!(short_tool_name("mcp__agent__wait"), "wait");
        assert_eq!(short_tool_name("wait"), "wait");
    }

    #[test]
    fn find_transcript_scans_project_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-srv-agent");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("sess-1.jsonl"), "{}").unwrap();

        assert_eq!(
            find_transcript(dir.path(), "sess-1"),
            Some(project.join("sess-1.jsonl"))
        );
        assert!(find_transcript(dir.path(), "sess-2").is_none());
    }
}
