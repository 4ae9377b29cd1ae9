//! Stateless request validation.
//!
//! Every check here is pure and total: malformed input is the expected case
//! and yields a failed check rather than a panic.  Size and length ceilings
//! mirror what the wizard UI enforces client-side, so a violation reaching
//! this layer is either a bug or a bypass attempt.

use serde_json::Value;

use crate::GenerationKind;

/// Serialized request ceiling in bytes.  Applied to both the raw body and
/// the re-serialized parsed structure.
pub const MAX_PAYLOAD_BYTES: usize = 50_000;
/// Prompt character bounds.
pub const MAX_PROMPT_CHARS: usize = 5_000;
pub const MIN_PROMPT_CHARS: usize = 10;

/// Outcome of a size/length check, carrying the measured value for
/// diagnostics and telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub valid: bool,
    pub measured: usize,
    pub reason: Option<String>,
}

impl Check {
    fn ok(measured: usize) -> Self {
        Check {
            valid: true,
            measured,
            reason: None,
        }
    }

    fn fail(measured: usize, reason: String) -> Self {
        Check {
            valid: false,
            measured,
            reason: Some(reason),
        }
    }
}

/// Validate a serialized payload size against `limit` bytes.
pub fn payload_size(measured: usize, limit: usize) -> Check {
    if measured > limit {
        Check::fail(
            measured,
            format!("request payload is {measured} bytes, limit is {limit}"),
        )
    } else {
        Check::ok(measured)
    }
}

/// Validate prompt character length against the fixed [MIN, MAX] bounds.
/// Too-short and too-long report distinct reasons.
pub fn prompt_length(prompt: &str) -> Check {
    let measured = prompt.chars().count();
    if measured < MIN_PROMPT_CHARS {
        Check::fail(
            measured,
            format!("prompt is {measured} characters, minimum is {MIN_PROMPT_CHARS}"),
        )
    } else if measured > MAX_PROMPT_CHARS {
        Check::fail(
            measured,
            format!("prompt is {measured} characters, maximum is {MAX_PROMPT_CHARS}"),
        )
    } else {
        Check::ok(measured)
    }
}

/// Resolve the `type` field into a [`GenerationKind`].  Missing, non-string
/// and unrecognized values all fail; the message enumerates the valid set.
pub fn request_type(value: Option<&Value>) -> Result<GenerationKind, String> {
    let valid_set = "features, kpis, implementation";
    match value {
        None => Err(format!("missing \"type\"; must be one of: {valid_set}")),
        Some(Value::String(s)) => GenerationKind::parse(s)
            .ok_or_else(|| format!("unknown type {s:?}; must be one of: {valid_set}")),
        Some(_) => Err(format!("\"type\" must be a string; one of: {valid_set}")),
    }
}

/// Presence/type check on the `prompt` field, distinct from length
/// validation and performed before it.
pub fn prompt_field(value: Option<&Value>) -> Result<&str, String> {
    match value {
        None => Err("missing \"prompt\" field".to_string()),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err("\"prompt\" must be a string".to_string()),
    }
}
