//! Gate failure taxonomy.
//!
//! Every rejection path in the service maps to one variant here, and every
//! variant maps to exactly one HTTP status and one telemetry category.
//! Variants carrying a `String` keep it for logs only; the caller-facing
//! message is the fixed `Display` text.

use axum::http::StatusCode;
use thiserror::Error;

use crate::scanner::ThreatLabel;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Missing or invalid authorization")]
    Unauthenticated,
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },
    #[error("Request payload too large (limit {limit} bytes)")]
    PayloadTooLarge { measured: usize, limit: usize },
    #[error("{0}")]
    Malformed(String),
    #[error("Prompt rejected by security screening")]
    ThreatDetected { labels: Vec<ThreatLabel> },
    #[error("AI provider is rate limiting requests, try again shortly")]
    UpstreamRateLimited,
    #[error("AI provider rejected the request: payment required")]
    UpstreamPaymentRequired,
    #[error("AI provider did not answer within the allotted time")]
    UpstreamTimeout,
    #[error("AI provider request failed")]
    UpstreamFailure(String),
    #[error("AI provider returned an unexpected response structure")]
    SchemaViolation(String),
    #[error("Generation contract misconfigured")]
    Configuration(String),
}

/// Telemetry category names, one per variant.  The metrics registry
/// pre-allocates a counter for each.
pub const CATEGORIES: &[&str] = &[
    "unauthenticated",
    "rate_limited",
    "payload_too_large",
    "malformed",
    "threat_detected",
    "upstream_rate_limited",
    "upstream_payment_required",
    "upstream_timeout",
    "upstream_failure",
    "schema_violation",
    "configuration",
];

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GateError::Malformed(_) => StatusCode::BAD_REQUEST,
            GateError::ThreatDetected { .. } => StatusCode::BAD_REQUEST,
            GateError::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            GateError::UpstreamPaymentRequired => StatusCode::PAYMENT_REQUIRED,
            GateError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GateError::UpstreamFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::SchemaViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            GateError::Unauthenticated => "unauthenticated",
            GateError::RateLimited { .. } => "rate_limited",
            GateError::PayloadTooLarge { .. } => "payload_too_large",
            GateError::Malformed(_) => "malformed",
            GateError::ThreatDetected { .. } => "threat_detected",
            GateError::UpstreamRateLimited => "upstream_rate_limited",
            GateError::UpstreamPaymentRequired => "upstream_payment_required",
            GateError::UpstreamTimeout => "upstream_timeout",
            GateError::UpstreamFailure(_) => "upstream_failure",
            GateError::SchemaViolation(_) => "schema_violation",
            GateError::Configuration(_) => "configuration",
        }
    }

    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GateError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Triggered scanner labels, for the `details` list on 400s.
    pub fn threat_labels(&self) -> Option<&[ThreatLabel]> {
        match self {
            GateError::ThreatDetected { labels } => Some(labels),
            _ => None,
        }
    }

    /// Internal diagnostic detail, logged but never sent to the caller.
    pub fn internal_detail(&self) -> Option<&str> {
        match self {
            GateError::UpstreamFailure(d)
            | GateError::SchemaViolation(d)
            | GateError::Configuration(d) => Some(d),
            _ => None,
        }
    }
}
