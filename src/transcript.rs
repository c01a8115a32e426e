//! Session transcript metrics.
//!
//! The session provider appends one JSON document per line to its transcript
//! file. We read it to derive live context usage (for the mid-tick wrap-up
//! advisory) and cumulative token totals (for the end-of-tick summary).
//! Malformed lines are skipped; a transcript we can't read yields zeroes.

use std::io::{BufRead, BufReader};
use std::path::Path;

use facet::Facet;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptMetrics {
    /// Current context size: the most recent non-zero cache read. Resets
    /// after a compaction, which is exactly what we want to track.
    pub context_tokens: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read: u64,
    pub total_cache_create: u64,
    pub message_count: u64,
    pub compaction_count: u64,
    /// Trigger and pre-compaction token count of the latest compaction.
    pub last_compaction: Option<(String, u64)>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Entry {
    #[facet(rename = "type", default)]
    kind: String,
    #[facet(default)]
    subtype: String,
    #[facet(default)]
    message: EntryMessage,
    #[facet(rename = "compactMetadata", default)]
    compact_metadata: CompactMetadata,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct EntryMessage {
    #[facet(default)]
    usage: Usage,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Usage {
    #[facet(default)]
    input_tokens: u64,
    #[facet(default)]
    output_tokens: u64,
    #[facet(default)]
    cache_read_input_tokens: u64,
    #[facet(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct CompactMetadata {
    #[facet(default)]
    trigger: String,
    #[facet(rename = "preTokens", default)]
    pre_tokens: u64,
}

pub fn parse_metrics(transcript: &Path) -> TranscriptMetrics {
    let mut metrics = TranscriptMetrics::default();

    let Ok(file) = std::fs::File::open(transcript) else {
        return metrics;
    };

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(entry) = facet_json::from_str::<Entry>(&line) else {
            continue;
        };
        metrics.message_count += 1;

        if entry.kind == "system" && entry.subtype == "compact_boundary" {
            metrics.compaction_count += 1;
            metrics.last_compaction = Some((
                entry.compact_metadata.trigger.clone(),
                entry.compact_metadata.pre_tokens,
            ));
        }

        let usage = &entry.message.usage;
        if usage.input_tokens > 0
            || usage.output_tokens > 0
            || usage.cache_read_input_tokens > 0
            || usage.cache_creation_input_tokens > 0
        {
            metrics.total_input_tokens += usage.input_tokens;
            metrics.total_output_tokens += usage.output_tokens;
            metrics.total_cache_read += usage.cache_read_input_tokens;
            metrics.total_cache_create += usage.cache_creation_input_tokens;
            if usage.cache_read_input_tokens > 0 {
                metrics.context_tokens = usage.cache_read_input_tokens;
            }
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_transcript(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        (dir, path)
    }

    #[test]
    fn missing_transcript_is_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = parse_metrics(&dir.path().join("nope.jsonl"));
        assert_eq!(metrics, TranscriptMetrics::default());
    }

    #[test]
    fn sums_usage_and_tracks_context() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"assistant","message":{"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":1000,"cache_creation_input_tokens":200}}}"#,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":3,"output_tokens":7,"cache_read_input_tokens":1500}}}"#,
        ]);

        let metrics = parse_metrics(&path);
        assert_eq!(metrics.total_input_tokens, 13);
        assert_eq!(metrics.total_output_tokens, 12);
        assert_eq!(metrics.total_cache_read, 2500);
        assert_eq!(metrics.total_cache_create, 200);
        assert_eq!(metrics.context_tokens, 1500);
        assert_eq!(metrics.message_count, 2);
    }

    #[test]
    fn counts_compaction_boundaries() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"system","subtype":"compact_boundary","compactMetadata":{"trigger":"auto","preTokens":150000}}"#,
            r#"{"type":"assistant","message":{"usage":{"cache_read_input_tokens":2000}}}"#,
        ]);

        let metrics = parse_metrics(&path);
        assert_eq!(metrics.compaction_count, 1);
        assert_eq!(metrics.last_compaction, Some(("auto".to_string(), 150000)));
        assert_eq!(metrics.context_tokens, 2000);
    }

    #[test]
    fn skips_malformed_lines() {
        let (_dir, path) = write_transcript(&[
            "not json",
            r#"{"type":"assistant","message":{"usage":{"input_tokens":1}}}"#,
            "{truncated",
        ]);

        let metrics = parse_metrics(&path);
        assert_eq!(metrics.total_input_tokens, 1);
        assert_eq!(metrics.message_count, 1);
    }
}
