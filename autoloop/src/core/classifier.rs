//! Deterministic classification of attempt outcomes.
//!
//! The classifier only looks at the tail of the attempt log (see
//! [`OUTPUT_TAIL_CHARS`]), so a long-running worker's megabytes of output are
//! never rescanned.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::AttemptResult;

/// Number of trailing characters of output inspected for signatures.
pub const OUTPUT_TAIL_CHARS: usize = 2_000;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|resource[ _]exhausted")
        .expect("rate limit pattern compiles")
});

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)quota exceeded|exceeded your (current )?quota|insufficient[_ ]quota|billing hard limit|billing limit (reached|exceeded)|credit balance is too low|usage limit (reached|exceeded|hit)|reached your usage limit|out of credits|payment required",
    )
    .expect("quota pattern compiles")
});

/// What the driver should make of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    TimedOut,
    RateLimited,
    QuotaExhausted,
    Succeeded,
    Failed,
}

/// Classify an attempt from its result and the tail of its output.
///
/// Precedence: timeout, rate limit, quota, exit code. A worker that prints a
/// rate-limit message and still exits 0 is treated as rate limited.
pub fn classify(result: &AttemptResult, output_tail: &str) -> Classification {
    if result.timed_out {
        Classification::TimedOut
    } else if is_rate_limited(output_tail) {
        Classification::RateLimited
    } else if is_quota_exhausted(output_tail) {
        Classification::QuotaExhausted
    } else if result.exit_code == 0 {
        Classification::Succeeded
    } else {
        Classification::Failed
    }
}

pub fn is_rate_limited(text: &str) -> bool {
    RATE_LIMIT_RE.is_match(text)
}

pub fn is_quota_exhausted(text: &str) -> bool {
    QUOTA_RE.is_match(text)
}

/// Last `max_chars` characters of `text`, split on a char boundary.
pub fn tail(text: &str, max_chars: usize) -> &str {
    match text.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((start, _)) if max_chars > 0 => &text[start..],
        Some(_) => "",
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_wins_over_output() {
        let result = AttemptResult::timed_out(143);
        assert_eq!(
            classify(&result, "429 Too Many Requests"),
            Classification::TimedOut
        );
    }

    #[test]
    fn detects_rate_limit_signatures() {
        let failed = AttemptResult::exited(1);
        for text in [
            "Error: Rate limit reached for requests",
            "rate_limit_error",
            "HTTP 429",
            "...429 Too Many Requests...",
            "status: RESOURCE_EXHAUSTED",
        ] {
            assert_eq!(classify(&failed, text), Classification::RateLimited, "{text}");
        }
    }

    #[test]
    fn bare_429_must_stand_alone() {
        assert!(!is_rate_limited("processed 14290 tokens"));
        assert!(is_rate_limited("code=429"));
    }

    #[test]
    fn quota_is_distinct_from_rate_limit() {
        let failed = AttemptResult::exited(1);
        assert_eq!(
            classify(&failed, "Error: quota exceeded for this project"),
            Classification::QuotaExhausted
        );
        assert_eq!(
            classify(&failed, "Your credit balance is too low"),
            Classification::QuotaExhausted
        );
        assert!(!is_rate_limited("quota exceeded"));
    }

    #[test]
    fn quota_phrases_need_exhaustion_wording() {
        let failed = AttemptResult::exited(1);
        for text in [
            "insufficient_quota",
            "You have reached your usage limit for this month",
            "Claude usage limit reached. Resets at 5pm",
            "billing hard limit has been reached",
            "HTTP 402 Payment Required",
        ] {
            assert_eq!(classify(&failed, text), Classification::QuotaExhausted, "{text}");
        }
    }

    /// Ordinary prose about billing or limits must not flip a clean exit.
    #[test]
    fn successful_run_mentioning_billing_succeeds() {
        let ok = AttemptResult::exited(0);
        for text in [
            "Refactored the billing module; all tests pass",
            "Added a usage limit setting to the config page",
            "Show the credit balance on the account screen",
            "Enforce the billing limit in the checkout flow",
        ] {
            assert_eq!(classify(&ok, text), Classification::Succeeded, "{text}");
        }
    }

    #[test]
    fn exit_code_decides_unrecognized_output() {
        assert_eq!(
            classify(&AttemptResult::exited(0), "all done"),
            Classification::Succeeded
        );
        assert_eq!(
            classify(&AttemptResult::exited(2), "segfault"),
            Classification::Failed
        );
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("héllo wörld", 5), "wörld");
        assert_eq!(tail("abc", 0), "");
    }
}
