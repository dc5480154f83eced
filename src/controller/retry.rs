//! Per-object failure accounting for the controller loop

use crate::error::{Error, ErrorAction};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for the exponential retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct RetryEntry {
    failures: u32,
    not_before: Option<Instant>,
    /// Set after a non-retryable failure; cleared once the object changes
    blocked_version: Option<String>,
}

/// Tracks failed attempts per object key
#[derive(Debug)]
pub struct RetryTracker {
    /// Maximum attempts per object, 0 for unlimited
    threshold: u32,
    exponential: bool,
    entries: HashMap<String, RetryEntry>,
}

impl RetryTracker {
    pub fn new(threshold: u32, exponential: bool) -> Self {
        Self {
            threshold,
            exponential,
            entries: HashMap::new(),
        }
    }

    /// Whether `key` at `resource_version` may be attempted at `now`
    pub fn should_attempt(&mut self, key: &str, resource_version: Option<&str>, now: Instant) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return true;
        };

        if let Some(blocked) = &entry.blocked_version {
            if resource_version == Some(blocked.as_str()) {
                return false;
            }
            // The object changed since the permanent failure
            self.entries.remove(key);
            return true;
        }

        if self.threshold > 0 && entry.failures >= self.threshold {
            return false;
        }

        entry.not_before.map_or(true, |deadline| now >= deadline)
    }

    /// Record a failed attempt, returning the delay before the next one if any
    pub fn record_failure(
        &mut self,
        key: &str,
        resource_version: Option<&str>,
        error: &Error,
        now: Instant,
    ) -> Option<Duration> {
        let exponential = self.exponential;
        let threshold = self.threshold;
        let entry = self.entries.entry(key.to_string()).or_default();
        entry.failures = entry.failures.saturating_add(1);

        if threshold > 0 && entry.failures >= threshold {
            entry.not_before = None;
            return None;
        }

        if !error.is_retryable() {
            entry.blocked_version = Some(resource_version.unwrap_or_default().to_string());
            entry.not_before = None;
            return None;
        }

        let delay = match error.action() {
            ErrorAction::RequeueAfter(delay) => Some(delay),
            ErrorAction::RequeueWithBackoff if exponential => Some(backoff(entry.failures)),
            _ => None,
        };

        entry.not_before = delay.map(|d| now + d);
        delay
    }

    pub fn record_success(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |e| e.failures)
    }

    /// Whether `key` has used up its attempts
    pub fn exhausted(&self, key: &str) -> bool {
        self.threshold > 0 && self.failures(key) >= self.threshold
    }

    /// Forget keys of objects that no longer exist
    pub fn retain(&mut self, mut live: impl FnMut(&str) -> bool) {
        self.entries.retain(|key, _| live(key));
    }
}

/// `2^failures` seconds, capped at [`MAX_BACKOFF`]
pub fn backoff(failures: u32) -> Duration {
    let secs = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}
