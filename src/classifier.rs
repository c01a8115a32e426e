//! Provider failure classification for the tick loop.
//!
//! Three detection layers folded into one stateful detector per tick: the
//! structured error field on assistant events, phrase matching on assistant
//! text (some providers surface errors as plain text), and the result event's
//! error flag. The first detection wins until `reset()`.

/// What a failure means for the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable upstream failure (5xx, overload, timeout).
    Transient,
    /// Retryable, with the provider hinting at backoff.
    RateLimited,
    /// Input exceeds the context window; end the tick before compaction.
    ContextOverflow,
    /// Permanent provider rejection (e.g. prompt too long for any retry);
    /// pauses the instance.
    FatalProvider,
    /// Unclassified; treated as transient for retry purposes.
    Unknown,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::FatalProvider)
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Unknown
        )
    }
}

#[derive(Debug, Clone)]
pub struct DetectedError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Which layer caught it; useful for pruning layers later.
    pub via: &'static str,
}

// Provider phrases indicating the input can never fit.
const FATAL_PHRASES: &[&str] = &["prompt is too long"];

// Provider phrases indicating the context window was exceeded mid-flight.
const OVERFLOW_PHRASES: &[&str] = &["context_length_exceeded", "input is too long"];

// Provider phrases indicating rate limiting / overload.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "you've hit your limit",
    "you have hit your limit",
    "rate limit",
    "rate_limit",
    "quota exceeded",
    "billing_error",
    "overloaded",
    "529",
];

/// Stateful error detector for a single tick.
#[derive(Debug, Default)]
pub struct ErrorDetector {
    current: Option<DetectedError>,
}

impl ErrorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear error state for a retry.
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&DetectedError> {
        self.current.as_ref()
    }

    pub fn is_fatal(&self) -> bool {
        self.current.as_ref().is_some_and(|e| e.kind.is_fatal())
    }

    /// Layer 1: the structured error field on an assistant event.
    pub fn check_event_error(&mut self, error: Option<&str>) -> Option<&DetectedError> {
        if self.current.is_some() {
            return None;
        }
        let error = error?;
        if error.is_empty() {
            return None;
        }
        let kind = match error {
            "invalid_request" => ErrorKind::FatalProvider,
            "rate_limit" | "billing_error" => ErrorKind::RateLimited,
            _ => ErrorKind::Transient,
        };
        self.current = Some(DetectedError {
            kind,
            detail: error.to_string(),
            via: "event.error",
        });
        self.current.as_ref()
    }

    /// Layer 2: phrase matching on assistant text.
    pub fn check_text(&mut self, text: &str) -> Option<&DetectedError> {
        if self.current.is_some() {
            return None;
        }
        let lower = text.to_lowercase();

        let kind = if FATAL_PHRASES.iter().any(|p| lower.contains(p)) {
            ErrorKind::FatalProvider
        } else if OVERFLOW_PHRASES.iter().any(|p| lower.contains(p)) {
            ErrorKind::ContextOverflow
        } else if RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p)) {
            ErrorKind::RateLimited
        } else {
            return None;
        };

        self.current = Some(DetectedError {
            kind,
            detail: crate::util::truncate(text, 200).to_string(),
            via: "text_match",
        });
        self.current.as_ref()
    }

    /// Layer 3: the result event's error flag.
    pub fn check_result(&mut self, is_error: bool, text: &str) -> Option<&DetectedError> {
        if self.current.is_some() || !is_error {
            return None;
        }
        let lower = text.to_lowercase();
        let kind = if lower.contains("prompt") && lower.contains("long") {
            ErrorKind::FatalProvider
        } else {
            ErrorKind::Unknown
        };
        self.current = Some(DetectedError {
            kind,
            detail: crate::util::truncate(text, 200).to_string(),
            via: "result.is_error",
        });
        self.current.as_ref()
    }
}

/// Classify a failure raised outside the message stream (connection loss,
/// provider process exit, request rejection). Uses the same phrase tables as
/// the in-stream layers: one taxonomy regardless of where the failure
/// surfaced.
pub fn classify_failure(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if FATAL_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::FatalProvider;
    }
    if OVERFLOW_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::ContextOverflow;
    }
    if lower.contains("overload") || lower.contains("529") {
        return ErrorKind::Transient;
    }
    if lower.contains("rate") || lower.contains("429") || lower.contains("limit") {
        return ErrorKind::RateLimited;
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return ErrorKind::Transient;
    }
    ErrorKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_error_field_classification() {
        let mut d = ErrorDetector::new();
        let err = d.check_event_error(Some("rate_limit")).unwrap();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(!d.is_fatal());

        let mut d = ErrorDetector::new();
        let err = d.check_event_error(Some("invalid_request")).unwrap();
        assert_eq!(err.kind, ErrorKind::FatalProvider);
        assert!(d.is_fatal());
    }

    #[test]
    fn text_phrases_detected() {
        let mut d = ErrorDetector::new();
        assert!(d.check_text("everything is fine").is_none());
        let err = d.check_text("API Error: Overloaded (529)").unwrap();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.via, "text_match");
    }

    #[test]
    fn fatal_prompt_too_long_in_text() {
        let mut d = ErrorDetector::new();
        let err = d.check_text("Error: prompt is too long: 210000 tokens").unwrap();
        assert_eq!(err.kind, ErrorKind::FatalProvider);
        assert!(d.is_fatal());
    }

    #[test]
    fn overflow_phrases_are_not_fatal() {
        let mut d = ErrorDetector::new();
        let err = d.check_text("context_length_exceeded").unwrap();
        assert_eq!(err.kind, ErrorKind::ContextOverflow);
        assert!(!d.is_fatal());
    }

    #[test]
    fn first_detection_wins_until_reset() {
        let mut d = ErrorDetector::new();
        d.check_text("rate limit hit").unwrap();
        assert!(d.check_result(true, "prompt is too long").is_none());
        assert_eq!(d.current().unwrap().kind, ErrorKind::RateLimited);

        d.reset();
        assert!(d.current().is_none());
        d.check_result(true, "prompt is too long").unwrap();
        assert!(d.is_fatal());
    }

    #[test]
    fn result_flag_without_known_phrase_is_unknown() {
        let mut d = ErrorDetector::new();
        let err = d.check_result(true, "something odd happened").unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.kind.is_retryable());
    }

    #[test]
    fn classify_failure_covers_categories() {
        assert_eq!(classify_failure("upstream overloaded"), ErrorKind::Transient);
        assert_eq!(classify_failure("HTTP 429 too many requests"), ErrorKind::RateLimited);
        assert_eq!(classify_failure("request timed out"), ErrorKind::Transient);
        assert_eq!(
            classify_failure("prompt is too long: 250000 tokens > 200000"),
            ErrorKind::FatalProvider
        );
        assert_eq!(classify_failure("connection reset by peer"), ErrorKind::Unknown);
    }

    #[test]
    fn classify_failure_separates_overflow_from_fatal() {
        // Overflow ends the tick but must not pause the instance.
        assert_eq!(
            classify_failure("api error: context_length_exceeded"),
            ErrorKind::ContextOverflow
        );
        assert_eq!(
            classify_failure("input is too long for the requested model"),
            ErrorKind::ContextOverflow
        );
        assert!(!classify_failure("context_length_exceeded").is_fatal());
        assert!(classify_failure("prompt is too long").is_fatal());
    }
}
