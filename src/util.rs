//! Utility helpers for Genguard.
//!
//! This module exposes the prompt sanitizer, a wall-clock helper shared by
//! the rate limiter and telemetry, and a memoised Aho–Corasick matcher cache
//! used by the threat scanner for configurable literal phrase lists.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Current wall-clock time in milliseconds since the Unix epoch.  The rate
/// limiter takes `now` as a parameter so tests can drive the clock; request
/// handlers obtain it here.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Clean a validated prompt before it is forwarded upstream.
///
/// Strips NUL bytes and non-printable control characters (newline and tab
/// survive the strip, though tabs are folded by the collapse step), collapses
/// runs of spaces and tabs into a single space, and trims surrounding
/// whitespace.  Applying the function twice yields the same string as
/// applying it once.
pub fn sanitize_prompt(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch == ' ' || ch == '\t' {
            pending_space = true;
            continue;
        }
        if ch.is_control() && ch != '\n' {
            continue;
        }
        if pending_space {
            // A space run touching a newline folds into the newline.
            if !out.is_empty() && !out.ends_with('\n') && ch != '\n' {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(ch);
    }
    out.trim().to_string()
}

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared `AhoCorasick` matcher.
/// If a matcher for the list already exists in the cache, a cloned Arc is
/// returned.  Otherwise a new matcher is constructed and inserted.  The
/// caller must ensure that the pattern set does not change between calls.
pub fn ac_for(list: &[String]) -> Arc<AhoCorasick> {
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    // Build AC: case insensitive by lower-casing patterns
    let mut lower = Vec::with_capacity(list.len());
    for p in list {
        lower.push(p.to_lowercase());
    }
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)
        .unwrap();
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    arc
}
