//! Small shared utilities.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for upstream calls.
///
/// The default is no retry; a single fixed-delay retry (with jitter) is
/// opted into per tool and only applied to idempotent methods.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum RetryPolicy {
    /// Fail on the first error.
    None,
    /// Retry after a fixed delay, jittered by up to `jitter_ms`.
    Fixed {
        /// Total attempts, including the first one.
        attempts: u32,
        /// Base delay between attempts in milliseconds.
        delay_ms: u64,
        /// Additional random delay in `0..=jitter_ms` milliseconds.
        jitter_ms: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Attempts allowed by this policy (at least 1).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { attempts, .. } => (*attempts).max(1),
        }
    }

    /// Delay before the given retry (attempt numbers start at 1; the first
    /// attempt never waits).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed {
                delay_ms,
                jitter_ms,
                ..
            } => {
                if attempt <= 1 {
                    return Duration::ZERO;
                }
                let jitter = if *jitter_ms == 0 {
                    0
                } else {
                    fastrand::u64(0..=*jitter_ms)
                };
                Duration::from_millis(delay_ms + jitter)
            }
        }
    }
}

/// Truncate a string to at most `max` bytes on a char boundary.
///
/// Used when reflecting upstream response bodies into error payloads.
#[must_use]
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
