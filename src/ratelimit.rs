//! Per-caller admission control.
//!
//! Fixed-window counting with a minimum spacing between consecutive
//! requests.  State is a process-wide concurrent map keyed by caller
//! identity; the dashmap entry API holds the shard lock across the whole
//! read-modify-write, which keeps the count invariant under concurrent
//! requests from the same caller.  Nothing is persisted; the table dies with
//! the process.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Tunable admission policy.  The rule precedence in [`RateLimiter::admit`]
/// is fixed regardless of the values chosen here.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub window_ms: u64,
    pub max_requests: u32,
    pub min_interval_ms: u64,
    /// Table size past which expired entries are swept inline before the
    /// current request is processed.
    pub sweep_threshold: usize,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 10,
            min_interval_ms: 2_000,
            sweep_threshold: 10_000,
        }
    }
}

/// One caller's window state.  Replaced wholesale when the window expires.
#[derive(Debug, Clone)]
struct RateWindowEntry {
    count: u32,
    window_reset_at: u64,
    last_request_at: u64,
}

/// Outcome of an admission check.  The two rejection variants are distinct
/// so the caller can tell spacing violations from quota exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Admitted { remaining: u32, reset_at_ms: u64 },
    TooFrequent { retry_after_secs: u64 },
    QuotaExceeded { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RateDecision::Admitted { .. })
    }
}

/// Snapshot of a caller's current window, used to decorate success
/// responses with rate-limit headers.
#[derive(Debug, Clone, Copy)]
pub struct RateSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    policy: RatePolicy,
    entries: Arc<DashMap<String, RateWindowEntry>>,
}

fn ceil_ms_to_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Decide whether a request from `caller` arriving at `now_ms` is
    /// admitted.  Spacing violations take priority over quota violations.
    pub fn admit(&self, caller: &str, now_ms: u64) -> RateDecision {
        if self.entries.len() > self.policy.sweep_threshold {
            self.sweep(now_ms);
        }
        let fresh = RateWindowEntry {
            count: 1,
            window_reset_at: now_ms + self.policy.window_ms,
            last_request_at: now_ms,
        };
        match self.entries.entry(caller.to_string()) {
            Entry::Vacant(slot) => {
                let reset = fresh.window_reset_at;
                slot.insert(fresh);
                RateDecision::Admitted {
                    remaining: self.policy.max_requests.saturating_sub(1),
                    reset_at_ms: reset,
                }
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.window_reset_at <= now_ms {
                    let reset = fresh.window_reset_at;
                    *entry = fresh;
                    return RateDecision::Admitted {
                        remaining: self.policy.max_requests.saturating_sub(1),
                        reset_at_ms: reset,
                    };
                }
                let elapsed = now_ms.saturating_sub(entry.last_request_at);
                if elapsed < self.policy.min_interval_ms {
                    return RateDecision::TooFrequent {
                        retry_after_secs: ceil_ms_to_secs(self.policy.min_interval_ms - elapsed),
                    };
                }
                if entry.count >= self.policy.max_requests {
                    return RateDecision::QuotaExceeded {
                        retry_after_secs: ceil_ms_to_secs(entry.window_reset_at - now_ms),
                    };
                }
                entry.count += 1;
                entry.last_request_at = now_ms;
                RateDecision::Admitted {
                    remaining: self.policy.max_requests.saturating_sub(entry.count),
                    reset_at_ms: entry.window_reset_at,
                }
            }
        }
    }

    /// Re-read the caller's window for response headers.  A missing or
    /// expired entry reads as an untouched window.
    pub fn snapshot(&self, caller: &str, now_ms: u64) -> RateSnapshot {
        let limit = self.policy.max_requests;
        match self.entries.get(caller) {
            Some(entry) if entry.window_reset_at > now_ms => RateSnapshot {
                limit,
                remaining: limit.saturating_sub(entry.count),
                reset_at_ms: entry.window_reset_at,
            },
            _ => RateSnapshot {
                limit,
                remaining: limit,
                reset_at_ms: now_ms + self.policy.window_ms,
            },
        }
    }

    /// Number of tracked callers, expired entries included.
    pub fn tracked_callers(&self) -> usize {
        self.entries.len()
    }

    fn sweep(&self, now_ms: u64) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.window_reset_at > now_ms);
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = self.entries.len(), "swept expired rate entries");
        }
    }
}
