//! The tick engine — one bounded execution of the model against a fresh
//! session.
//!
//! Lifecycle: ensure container → increment tick counter → pre-tick hooks →
//! open session → model loop (tool dispatch, notification injection, context
//! monitoring, retry policy) → end-of-tick gate → closing (transcript copy,
//! archives, post-tick hooks). Ticks are stateless at the model layer;
//! continuity lives in the files the agent writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use facet::Facet;
use rand::Rng;
use tokio::sync::mpsc;

use crate::classifier::{ErrorDetector, ErrorKind, classify_failure};
use crate::config::PromptCache;
use crate::container::{self, ContainerHandle};
use crate::error::KernelError;
use crate::notifications::{Notification, Notifier, send_crash_notification};
use crate::provider::{Session, SessionEvent, SessionOptions, SessionProvider};
use crate::state::InstanceState;
use crate::tools::ToolHost;
use crate::tty::TtyManager;
use crate::util::truncate;

/// A hung tool call (or a silent provider) is cut off after this long.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RETRIES: u32 = 10;
const BACKOFF_CAP_SECS: u64 = 60;
/// Wrap-up advisory threshold: ~70% of a 200k context window.
const CONTEXT_WARN_TOKENS: u64 = 140_000;
const CONTEXT_WINDOW_TOKENS: u64 = 200_000;
const LAST_MESSAGE_ENV_MAX: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Normal,
    Abnormal,
}

impl TickStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TickStatus::Normal => "normal",
            TickStatus::Abnormal => "abnormal",
        }
    }
}

#[derive(Debug)]
pub struct TickOutcome {
    pub tick: u64,
    pub status: TickStatus,
    pub reason: Option<String>,
}

// ── Live status ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
struct LiveStatus {
    #[facet(default)]
    status: String,
    #[facet(default)]
    updated: String,
    tick: u64,
    #[facet(default)]
    tool: String,
}

/// Best-effort status file for out-of-process consumers (dashboards etc.).
fn write_live_status(data: &Path, status: &str, tick: u64, tool: &str) {
    let doc = LiveStatus {
        status: status.to_string(),
        updated: crate::logging::utc_timestamp(),
        tick,
        tool: tool.to_string(),
    };
    let _ = std::fs::write(
        crate::paths::live_status_file(data),
        facet_json::to_string(&doc).unwrap_or_default(),
    );
}

// ── Pause file ───────────────────────────────────────────

/// Written on fatal provider errors; its presence suppresses all ticks until
/// a human (or the agent, next time it runs) removes it.
fn write_pause_file(data: &Path, tick: u64, reason: &str) {
    let contents = format!(
        "Paused at {} due to {reason}.\nTick: {tick}\n\n\
         Options:\n\
         1. Delete this file to retry (may fail again)\n\
         2. Investigate the tick log for root cause\n",
        crate::logging::utc_timestamp()
    );
    if let Err(e) = std::fs::write(crate::paths::paused_file(data), contents) {
        tracing::error!("failed to write pause file: {e}");
    }
}

// ── Entry point ──────────────────────────────────────────

/// Run a single tick. Returns the outcome for both normal and abnormal
/// completions; hard failures (paused instance, no container, provider
/// won't open) surface as errors before the model ever runs.
pub async fn run_tick<P: SessionProvider>(
    provider: &P,
    data: &Path,
    instance_id: &str,
    prompt_cache: &mut PromptCache,
) -> Result<TickOutcome, KernelError> {
    let paused = crate::paths::paused_file(data);
    if paused.exists() {
        return Err(KernelError::Paused {
            path: paused.display().to_string(),
        });
    }

    crate::config::ensure_dirs(data)?;

    // Bring up the container. A failed image rebuild with a still-running
    // container degrades to the old image; the failure is reported to the
    // agent at login so it can fix its Containerfile.
    let container_name = container::container_name(instance_id);
    let (handle, build_error) = match container::ensure_ready(data, instance_id).await {
        Ok(handle) => (handle, None),
        Err(e) => {
            if container::container_running(&container_name).await {
                tracing::error!("container refresh failed, reusing running container: {e}");
                (ContainerHandle::new(container_name), Some(e.to_string()))
            } else {
                return Err(e);
            }
        }
    };

    // The tick counter increments exactly once per started tick, persisted
    // before pre-tick hooks run.
    let mut state = InstanceState::load(data);
    state.tick_count += 1;
    let tick = state.tick_count;
    state.last_tick_started = crate::logging::utc_timestamp();
    if state.first_tick_date.is_empty() {
        state.first_tick_date = crate::logging::utc_date();
    }
    state.save(data)?;

    let agent_config = crate::config::load_agent_config(data);
    let prefix = agent_config.hook_env_prefix.clone();
    let started = std::time::Instant::now();

    tracing::info!("============================================================");
    tracing::info!("TICK {tick} started");
    tracing::info!("============================================================");
    write_live_status(data, &format!("Tick {tick} starting"), tick, "");

    crate::hooks::run_hooks(
        &handle,
        data,
        "pre-tick",
        &[(format!("{prefix}_TICK"), tick.to_string())],
        crate::hooks::HOOK_TIMEOUT,
    )
    .await;

    let options = SessionOptions {
        model: agent_config.model.clone(),
        system_prompt: prompt_cache.load(data).to_string(),
        thinking_tokens: agent_config.thinking_tokens,
        tools: crate::tools::definitions(),
        agents: crate::config::load_agents(data),
        cwd: data.to_path_buf(),
    };
    let mut session = provider.open(&options).await?;

    let tty = Arc::new(TtyManager::new(data, tick, handle.clone()));
    tty.set_build_error(build_error);
    Arc::clone(&tty).start().await?;
    let host = ToolHost::new(Arc::clone(&tty), data);

    let (notifier, mut notif_rx) = Notifier::spawn(data);

    let initial = agent_config
        .initial_query
        .replace("{tick}", &tick.to_string())
        .replace("{data_dir}", &data.display().to_string());
    let outcome = match session.query(&initial).await {
        Ok(()) => {
            run_model_loop(
                &mut session,
                &host,
                &handle,
                data,
                tick,
                &prefix,
                &mut notif_rx,
            )
            .await
        }
        Err(e) => LoopOutcome {
            status: TickStatus::Abnormal,
            reason: Some(format!("initial query failed: {e}")),
            session_id: String::new(),
            last_text: String::new(),
        },
    };

    notifier.stop();
    session.shutdown().await;

    // Drain and archive whatever terminals remain (none, on a normal end),
    // then stop the capture loop.
    tty.close_all().await;
    tty.stop().await;

    let transcript = copy_transcript(session.transcript_path(), data, tick);

    let mut state = InstanceState::load(data);
    state.last_tick_ended = crate::logging::utc_timestamp();
    state.save(data)?;

    let duration = started.elapsed().as_secs_f64();
    let usage = transcript
        .as_deref()
        .map(crate::transcript::parse_metrics)
        .filter(|m| m.context_tokens > 0)
        .map(|m| {
            format!(
                " | context {}% ({}/{})",
                m.context_tokens * 100 / CONTEXT_WINDOW_TOKENS,
                m.context_tokens,
                CONTEXT_WINDOW_TOKENS
            )
        })
        .unwrap_or_default();

    tracing::info!("============================================================");
    tracing::info!(
        "TICK {tick} {} ({duration:.1}s){usage}",
        outcome.status.as_str().to_uppercase()
    );
    tracing::info!("============================================================");

    if outcome.status == TickStatus::Abnormal {
        let reason = outcome.reason.clone().unwrap_or_else(|| "unknown".into());
        send_crash_notification(data, &format!("Tick {tick} ended abnormally: {reason}"));
    }

    crate::hooks::run_hooks(
        &handle,
        data,
        "post-tick",
        &[
            (format!("{prefix}_TICK"), tick.to_string()),
            (format!("{prefix}_TICK_DURATION"), format!("{duration:.1}")),
            (
                format!("{prefix}_TICK_LOG"),
                transcript
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            (
                format!("{prefix}_LAST_MESSAGE"),
                truncate(&outcome.last_text, LAST_MESSAGE_ENV_MAX).to_string(),
            ),
            (format!("{prefix}_SESSION_ID"), outcome.session_id.clone()),
            (
                format!("{prefix}_TICK_STATUS"),
                outcome.status.as_str().to_string(),
            ),
        ],
        crate::hooks::HOOK_TIMEOUT,
    )
    .await;

    // Nothing lingers between ticks.
    let tmp = crate::paths::tmp_dir(data);
    let _ = std::fs::remove_dir_all(&tmp);

    Ok(TickOutcome {
        tick,
        status: outcome.status,
        reason: outcome.reason,
    })
}

// ── Model loop ───────────────────────────────────────────

pub(crate) struct LoopOutcome {
    pub status: TickStatus,
    pub reason: Option<String>,
    pub session_id: String,
    pub last_text: String,
}

/// Drive the session's event stream until the end-of-tick gate passes or the
/// tick is cut short. Notifications interleave between events; tool calls
/// are dispatched inline under a watchdog.
pub(crate) async fn run_model_loop<S: Session>(
    session: &mut S,
    host: &ToolHost,
    container: &ContainerHandle,
    data: &Path,
    tick: u64,
    prefix: &str,
    notif_rx: &mut mpsc::Receiver<Notification>,
) -> LoopOutcome {
    let mut detector = ErrorDetector::new();
    let mut retries: u32 = 0;
    let mut context_warning_sent = false;
    let mut session_id = String::new();
    let mut last_text = String::new();

    let abnormal = |reason: String, session_id: &str, last_text: &str| LoopOutcome {
        status: TickStatus::Abnormal,
        reason: Some(reason),
        session_id: session_id.to_string(),
        last_text: last_text.to_string(),
    };

    enum Step {
        Notify(Notification),
        Event(Result<Result<Option<SessionEvent>, KernelError>, tokio::time::error::Elapsed>),
    }

    loop {
        // Arms only move values out; the session borrow held by the event
        // future ends with the select statement.
        let step = tokio::select! {
            biased;
            Some(notification) = notif_rx.recv() => Step::Notify(notification),
            event = tokio::time::timeout(TOOL_CALL_TIMEOUT, session.next_event()) => Step::Event(event),
        };

        let event = match step {
            Step::Notify(notification) => {
                // Unblock any in-flight wait so the agent sees the message
                // promptly, then inject. The file is deleted only once the
                // injection succeeded (at-most-once delivery).
                host.tty.interrupt();
                match session.query(&notification.text).await {
                    Ok(()) => {
                        let _ = std::fs::remove_file(&notification.path);
                    }
                    Err(e) => tracing::warn!("notification injection failed: {e}"),
                }
                continue;
            }
            Step::Event(event) => event,
        };

        let event = match event {
            Err(_) => {
                tracing::warn!(
                    "no provider activity for {}s, terminating tick",
                    TOOL_CALL_TIMEOUT.as_secs()
                );
                return abnormal("provider silent for 300s".into(), &session_id, &last_text);
            }
            Ok(Err(e)) => {
                let kind = classify_failure(&e.to_string());
                if kind.is_fatal() {
                    write_pause_file(data, tick, &format!("fatal provider error: {e}"));
                }
                tracing::warn!("session stream error ({kind:?}): {e}");
                return abnormal(format!("session stream error: {e}"), &session_id, &last_text);
            }
            Ok(Ok(None)) => {
                return abnormal(
                    "session ended before tick completion".into(),
                    &session_id,
                    &last_text,
                );
            }
            Ok(Ok(Some(event))) => event,
        };

        match event {
            SessionEvent::Init { session_id: sid } => {
                tracing::info!(session_id = %sid, "session established");
                session_id = sid;
            }

            SessionEvent::Compacting { trigger } => {
                // Losing mid-tick context to compaction is worse than ending
                // the tick; continuity lives in files, not the transcript.
                tracing::warn!(%trigger, "context limit hit, ending tick before compaction");
                return abnormal("context compaction imminent".into(), &session_id, &last_text);
            }

            SessionEvent::Assistant {
                text,
                tool_calls,
                error,
            } => {
                if let Some(err) = detector.check_event_error(error.as_deref()) {
                    tracing::warn!("provider error: {:?} ({})", err.kind, err.via);
                }
                if !text.is_empty() {
                    last_text = text.clone();
                    if let Some(err) = detector.check_text(&text) {
                        tracing::warn!("error in assistant text: {:?} ({})", err.kind, err.via);
                    }
                }

                for call in tool_calls {
                    write_live_status(data, &format!("Tick {tick}: {}", call.name), tick, &call.name);

                    // close must never be cancelled mid-archive; everything
                    // else runs under the watchdog.
                    let output = if call.name == "close" {
                        host.dispatch(&call.name, &call.args).await
                    } else {
                        match tokio::time::timeout(
                            TOOL_CALL_TIMEOUT,
                            host.dispatch(&call.name, &call.args),
                        )
                        .await
                        {
                            Ok(output) => output,
                            Err(_) => {
                                tracing::warn!(tool = %call.name, "tool call timed out");
                                return abnormal(
                                    format!("tool call '{}' timed out", call.name),
                                    &session_id,
                                    &last_text,
                                );
                            }
                        }
                    };

                    if let Err(e) = session.tool_result(&call.id, &output).await {
                        return abnormal(
                            format!("tool result delivery failed: {e}"),
                            &session_id,
                            &last_text,
                        );
                    }
                }

                // Context monitor: one advisory as usage approaches the
                // window, before the provider is forced to compact.
                if !context_warning_sent
                    && let Some(transcript) = session.transcript_path()
                {
                    let metrics = crate::transcript::parse_metrics(&transcript);
                    if metrics.context_tokens >= CONTEXT_WARN_TOKENS {
                        context_warning_sent = true;
                        let pct = metrics.context_tokens * 100 / CONTEXT_WINDOW_TOKENS;
                        tracing::warn!(
                            context_tokens = metrics.context_tokens,
                            "context at {pct}%, advising wrap-up"
                        );
                        let advisory = format!(
                            "Context at {pct}% ({} tokens). Wrap up now — save your work, \
                             close TTYs, and end the tick. The tick will be forcibly \
                             terminated if context fills up.",
                            metrics.context_tokens
                        );
                        if let Err(e) = session.query(&advisory).await {
                            tracing::warn!("wrap-up advisory failed: {e}");
                        }
                    }
                }
            }

            SessionEvent::Result { is_error, text } => {
                if let Some(err) = detector.check_result(is_error, &text) {
                    tracing::warn!("result error: {:?} ({})", err.kind, err.via);
                }

                if detector.is_fatal() {
                    write_pause_file(data, tick, "fatal provider error");
                    tracing::error!("fatal provider error, pausing to prevent crash loop");
                    return abnormal("fatal provider error".into(), &session_id, &last_text);
                }

                if let Some(err) = detector.current() {
                    if err.kind == ErrorKind::ContextOverflow {
                        return abnormal("context overflow".into(), &session_id, &last_text);
                    }
                    if retries < MAX_RETRIES {
                        retries += 1;
                        let delay = backoff_delay(retries);
                        tracing::warn!(
                            "transient error ({:?}): retry {retries}/{MAX_RETRIES} in {:.1}s",
                            err.kind,
                            delay.as_secs_f64()
                        );
                        detector.reset();
                        tokio::time::sleep(delay).await;
                        if let Err(e) = session
                            .query(
                                "The previous API call hit a transient error. Continue \
                                 where you left off.",
                            )
                            .await
                        {
                            return abnormal(
                                format!("retry nudge failed: {e}"),
                                &session_id,
                                &last_text,
                            );
                        }
                        continue;
                    }
                    tracing::error!("retries exhausted ({MAX_RETRIES}), ending tick");
                    return abnormal("transient error retries exhausted".into(), &session_id, &last_text);
                }

                // End-of-tick gate: a pure text turn ended. The tick may only
                // close when the kernel checks pass and pre-stop hooks raise
                // no blocking lines.
                let mut issues = crate::tools::login::tick_end_issues(host).await;

                if host.is_logged_in() {
                    let env = [
                        (format!("{prefix}_TICK"), tick.to_string()),
                        (
                            format!("{prefix}_LAST_MESSAGE"),
                            truncate(&last_text, LAST_MESSAGE_ENV_MAX).to_string(),
                        ),
                        (format!("{prefix}_SESSION_ID"), session_id.clone()),
                    ];
                    issues.extend(
                        crate::hooks::run_collect(
                            container,
                            data,
                            "pre-stop",
                            &env,
                            crate::hooks::PRE_STOP_TIMEOUT,
                        )
                        .await,
                    );
                }

                if last_text.trim().is_empty() {
                    issues.push("Send a final message before the tick can end.".to_string());
                }

                if !issues.is_empty() {
                    let nag = format!(
                        "Tick can't end yet:\n{}",
                        issues
                            .iter()
                            .map(|i| format!("- {i}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    );
                    if let Err(e) = session.query(&nag).await {
                        return abnormal(
                            format!("end-gate nudge failed: {e}"),
                            &session_id,
                            &last_text,
                        );
                    }
                    continue;
                }

                return LoopOutcome {
                    status: TickStatus::Normal,
                    reason: None,
                    session_id,
                    last_text,
                };
            }
        }
    }
}

/// Exponential backoff with jitter: `min(2^attempt, 60)` seconds scaled into
/// `[0.5, 1.0)` of itself.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(BACKOFF_CAP_SECS);
    let factor = rand::thread_rng().gen_range(0.5..1.0);
    Duration::from_secs_f64(base as f64 * factor)
}

fn copy_transcript(source: Option<PathBuf>, data: &Path, tick: u64) -> Option<PathBuf> {
    let source = source?;
    let dest = crate::paths::tick_log_file(data, tick);
    match std::fs::copy(&source, &dest) {
        Ok(_) => Some(dest),
        Err(e) => {
            tracing::warn!("failed to copy transcript: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolCall;
    use crate::provider::testing::ScriptedSession;
    use crate::tools::ToolArgs;

    fn fixture() -> (tempfile::TempDir, ToolHost, ContainerHandle) {
        let dir = tempfile::tempdir().unwrap();
        crate::config::ensure_dirs(dir.path()).unwrap();
        let container = ContainerHandle::new("tock-test".into());
        let tty = Arc::new(TtyManager::new(dir.path(), 1, container.clone()));
        let host = ToolHost::new(tty, dir.path());
        (dir, host, container)
    }

    fn assistant(text: &str) -> SessionEvent {
        SessionEvent::Assistant {
            text: text.into(),
            tool_calls: vec![],
            error: None,
        }
    }

    fn result_ok() -> SessionEvent {
        SessionEvent::Result {
            is_error: false,
            text: String::new(),
        }
    }

    async fn drive(
        session: &mut ScriptedSession,
        host: &ToolHost,
        container: &ContainerHandle,
        data: &Path,
    ) -> LoopOutcome {
        let (_tx, mut rx) = mpsc::channel(4);
        run_model_loop(session, host, container, data, 1, "AGENT", &mut rx).await
    }

    #[tokio::test]
    async fn normal_end_when_gate_passes() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let mut session = ScriptedSession::new(vec![
            Ok(SessionEvent::Init {
                session_id: "s1".into(),
            }),
            Ok(assistant("All done for this tick.")),
            Ok(result_ok()),
        ]);

        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Normal);
        assert_eq!(outcome.session_id, "s1");
        assert_eq!(outcome.last_text, "All done for this tick.");
        assert!(session.queries.is_empty());
    }

    #[tokio::test]
    async fn gate_nags_until_login() {
        let (dir, host, container) = fixture();

        let mut session = ScriptedSession::new(vec![
            Ok(assistant("Done!")),
            Ok(result_ok()),
            // After the nag the stream ends without recovery.
        ]);

        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Abnormal);
        assert_eq!(session.queries.len(), 1);
        assert!(session.queries[0].contains("Tick can't end yet"));
        assert!(session.queries[0].contains("login()"));
    }

    #[tokio::test]
    async fn gate_requires_final_message() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let mut session = ScriptedSession::new(vec![
            Ok(result_ok()),
            Ok(assistant("Now I'm done.")),
            Ok(result_ok()),
        ]);

        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Normal);
        assert_eq!(session.queries.len(), 1);
        assert!(session.queries[0].contains("final message"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_bounded_backoff() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let mut session = ScriptedSession::new(vec![
            Ok(SessionEvent::Result {
                is_error: true,
                text: "overloaded (529)".into(),
            }),
            Ok(SessionEvent::Result {
                is_error: true,
                text: "overloaded (529)".into(),
            }),
            Ok(assistant("Recovered, finishing up.")),
            Ok(result_ok()),
        ]);

        let start = tokio::time::Instant::now();
        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        let elapsed = start.elapsed();

        assert_eq!(outcome.status, TickStatus::Normal);
        // Two retry nudges delivered.
        let nudges: Vec<_> = session
            .queries
            .iter()
            .filter(|q| q.contains("transient error"))
            .collect();
        assert_eq!(nudges.len(), 2);
        // Backoff sum: jittered 2s + 4s, each in [0.5, 1.0) of itself.
        assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(6), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn fatal_error_writes_pause_file() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let mut session = ScriptedSession::new(vec![Ok(SessionEvent::Result {
            is_error: true,
            text: "prompt is too long: 250000 tokens".into(),
        })]);

        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Abnormal);
        let pause = crate::paths::paused_file(dir.path());
        assert!(pause.exists());
        let contents = std::fs::read_to_string(pause).unwrap();
        assert!(contents.contains("Tick: 1"));
    }

    #[tokio::test]
    async fn compaction_signal_ends_tick_abnormally() {
        let (dir, host, container) = fixture();
        let mut session = ScriptedSession::new(vec![Ok(SessionEvent::Compacting {
            trigger: "auto".into(),
        })]);

        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Abnormal);
        assert!(outcome.reason.unwrap().contains("compaction"));
        // No pause file: compaction is abnormal, not fatal.
        assert!(!crate::paths::paused_file(dir.path()).exists());
    }

    #[tokio::test]
    async fn context_advisory_sent_exactly_once() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let transcript = dir.path().join("session.jsonl");
        std::fs::write(
            &transcript,
            r#"{"type":"assistant","message":{"usage":{"cache_read_input_tokens":150000}}}"#,
        )
        .unwrap();

        let mut session = ScriptedSession::new(vec![
            Ok(assistant("working...")),
            Ok(assistant("still working...")),
            Ok(assistant("done now")),
            Ok(result_ok()),
        ]);
        session.transcript = Some(transcript);

        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Normal);

        let advisories: Vec<_> = session
            .queries
            .iter()
            .filter(|q| q.contains("Wrap up now"))
            .collect();
        assert_eq!(advisories.len(), 1);
        assert!(advisories[0].contains("75%"));
    }

    #[tokio::test]
    async fn stream_end_without_gate_is_abnormal() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let mut session = ScriptedSession::new(vec![Ok(assistant("mid-thought"))]);
        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Abnormal);
        assert!(outcome.reason.unwrap().contains("session ended"));
    }

    #[tokio::test]
    async fn tool_calls_get_results_even_for_unknown_tools() {
        let (dir, host, container) = fixture();
        let mut session = ScriptedSession::new(vec![Ok(SessionEvent::Assistant {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "tu_1".into(),
                name: "frobnicate".into(),
                args: ToolArgs::default(),
            }],
            error: None,
        })]);

        drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(session.tool_results.len(), 1);
        let (id, output) = &session.tool_results[0];
        assert_eq!(id, "tu_1");
        assert!(output.is_error);
        assert!(output.text.contains("unknown tool"));
    }

    #[tokio::test]
    async fn retries_exhaust_to_abnormal() {
        let (dir, host, container) = fixture();
        host.set_logged_in(true);

        let mut events: Vec<Result<SessionEvent, KernelError>> = Vec::new();
        for _ in 0..=MAX_RETRIES {
            events.push(Ok(SessionEvent::Result {
                is_error: true,
                text: "rate limit".into(),
            }));
        }
        let mut session = ScriptedSession::new(events);

        tokio::time::pause();
        let outcome = drive(&mut session, &host, &container, dir.path()).await;
        assert_eq!(outcome.status, TickStatus::Abnormal);
        assert!(outcome.reason.unwrap().contains("retries exhausted"));
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        for attempt in 1..=12 {
            let delay = backoff_delay(attempt);
            let base = 2u64.saturating_pow(attempt).min(BACKOFF_CAP_SECS) as f64;
            assert!(delay.as_secs_f64() >= base * 0.5 - f64::EPSILON);
            assert!(delay.as_secs_f64() <= base);
        }
    }

    #[test]
    fn transcript_copy_lands_in_tick_log() {
        let dir = tempfile::tempdir().unwrap();
        crate::config::ensure_dirs(dir.path()).unwrap();
        let src = dir.path().join("src.jsonl");
        std::fs::write(&src, "{}\n").unwrap();

        let dest = copy_transcript(Some(src), dir.path(), 12).unwrap();
        assert!(dest.ends_with("system/logs/tick-012.jsonl"));
        assert!(dest.exists());

        assert!(copy_transcript(None, dir.path(), 13).is_none());
    }
}
