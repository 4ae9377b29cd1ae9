//! Caller identification.
//!
//! The gate does not verify credentials cryptographically; an upstream
//! collaborator issues and validates the bearer token.  This module only
//! extracts the token, optionally checks it against a static allowlist
//! (strict mode for closed deployments), and decodes the subject claim from
//! the payload segment to key rate limiting and audit events.

use std::collections::HashSet;

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::GateError;

/// Pull the bearer token out of the `Authorization` header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, GateError> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(GateError::Unauthenticated)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(GateError::Unauthenticated);
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(GateError::Unauthenticated);
    }
    Ok(token)
}

/// Decode the `sub` claim from a JWT-shaped credential without verifying the
/// signature.  Returns `None` for anything that does not carry a non-empty
/// subject.
pub fn subject_of(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let sub = claims.get("sub")?.as_str()?.trim();
    if sub.is_empty() {
        None
    } else {
        Some(sub.to_string())
    }
}

/// Resolve the caller identity for a request, enforcing the optional strict
/// token allowlist first.  Any failure collapses to `Unauthenticated`.
pub fn caller_identity(
    headers: &HeaderMap,
    allowed_tokens: Option<&HashSet<String>>,
) -> Result<String, GateError> {
    let token = extract_bearer_token(headers)?;
    if let Some(tokens) = allowed_tokens {
        if !tokens.contains(token) {
            return Err(GateError::Unauthenticated);
        }
    }
    subject_of(token).ok_or(GateError::Unauthenticated)
}
