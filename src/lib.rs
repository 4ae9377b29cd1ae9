//! Core library for Genguard.  This module wires together the request gate,
//! the generation dispatcher, response composition and HTTP handlers.  The
//! gate itself is deliberately sequential: each check either passes the
//! request to the next stage or terminates it with a typed rejection, and
//! every outcome is recorded as a structured security event before the
//! response leaves the process.

mod config;
pub mod auth;
pub mod dispatch;
pub mod error;
pub mod ratelimit;
pub mod scanner;
pub mod util;
pub mod validate;

pub use config::AppConfig;
pub use error::GateError;
pub use ratelimit::{RateDecision, RateLimiter, RatePolicy};
pub use scanner::{ScanConfig, ThreatLabel};

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;

use crate::dispatch::GenerationDispatcher;

/// The generation kinds the wizard can request.  Each maps to one
/// [`dispatch::ToolContract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Features,
    Kpis,
    Implementation,
}

impl GenerationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "features" => Some(GenerationKind::Features),
            "kpis" => Some(GenerationKind::Kpis),
            "implementation" => Some(GenerationKind::Implementation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Features => "features",
            GenerationKind::Kpis => "kpis",
            GenerationKind::Implementation => "implementation",
        }
    }
}

/// Internal application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: RateLimiter,
    pub dispatcher: Arc<GenerationDispatcher>,
    pub scan_config: ScanConfig,
    /// Maximum accepted request body size in bytes (raw and re-serialized).
    pub max_request_bytes: usize,
    pub allowed_tokens: Option<HashSet<String>>, // strict auth allowlist
    pub telemetry: TelemetrySink,
    // Metrics counters
    pub metric_requests_total: Arc<AtomicU64>,
    pub rejection_category_indices: Arc<std::collections::HashMap<&'static str, usize>>,
    pub rejection_counts: Arc<Vec<AtomicU64>>, // index aligned with error::CATEGORIES
    // Histogram buckets (fixed) for request latency in ms (upper bounds) and counts
    pub hist_buckets: Arc<Vec<u64>>,
    pub hist_counts: Arc<Vec<AtomicU64>>,
    pub hist_sum_ms: Arc<AtomicU64>,
    pub hist_count: Arc<AtomicU64>,
    // Process start time (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Simple size-based rotating writer (numbered backups, optional gzip).
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    fn write_line_result(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            let over = self
                .path
                .metadata()
                .map(|meta| meta.len() >= limit)
                .unwrap_or(false);
            if over {
                self.rotate();
            }
        }
        writeln!(self.file, "{}", line)
    }

    fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn rotate(&mut self) {
        if self.keep > 0 {
            // Shift existing backups up by one slot, current file becomes .1.
            for idx in (1..=self.keep).rev() {
                let old = if idx == 1 {
                    self.path.clone()
                } else {
                    self.path.with_extension(format!("{}", idx - 1))
                };
                if old.exists() {
                    let _ = fs::rename(&old, self.path.with_extension(format!("{}", idx)));
                }
            }
            if self.compress {
                self.gzip_backup();
            }
        }
        if let Ok(fresh) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = fresh;
        }
    }

    fn gzip_backup(&self) {
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(rotated.with_extension("1.gz"), buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }
}

/// Per-request fields mirrored to stdout alongside the JSON line.
pub struct EventLogFields<'a> {
    pub allowed: bool,
    pub category: Option<&'a str>,
    pub caller: Option<&'a str>,
    pub latency_ms: u128,
}

pub struct AuditLogFields<'a> {
    pub category: &'a str,
    pub caller: Option<&'a str>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TelemetryKind {
    Event,
    Audit,
}

/// Sink for newline-delimited JSON security events.  A write failure is
/// counted and logged but never fails the request being recorded.
#[derive(Clone)]
pub struct TelemetrySink {
    event_writer: Option<Arc<Mutex<RotatingWriter>>>,
    audit_writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    log_sample_n: Option<u64>,
    log_sample_counter: Arc<AtomicU64>,
    metric_lines_total: Arc<AtomicU64>,
    metric_write_errors_total: Arc<AtomicU64>,
    log_file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(
        event_writer: Option<Arc<Mutex<RotatingWriter>>>,
        audit_writer: Option<Arc<Mutex<RotatingWriter>>>,
        log_stdout: bool,
        log_sample_n: Option<u64>,
        metric_lines_total: Arc<AtomicU64>,
        metric_write_errors_total: Arc<AtomicU64>,
        log_file_size_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            event_writer,
            audit_writer,
            log_stdout,
            log_sample_n,
            log_sample_counter: Arc::new(AtomicU64::new(0)),
            metric_lines_total,
            metric_write_errors_total,
            log_file_size_bytes,
        }
    }

    /// Record one request outcome (allowed or rejected).
    pub fn emit_event(&self, payload: &serde_json::Value, log: &EventLogFields<'_>) {
        let writer = self.event_writer.as_ref();
        let wrote = self.write_line(payload, writer, TelemetryKind::Event);
        if (wrote || writer.is_none()) && self.should_log_stdout() {
            tracing::info!(
                target = "telemetry",
                event = "gate",
                allowed = log.allowed,
                category = ?log.category,
                caller = ?log.caller,
                latencyMs = log.latency_ms,
            );
        }
    }

    /// Mirror a rejection to the dedicated audit stream.  When none is
    /// configured the record still reaches the event stream, so nothing is
    /// duplicated or lost here.
    pub fn emit_audit(&self, payload: &serde_json::Value, log: &AuditLogFields<'_>) {
        let Some(writer) = self.audit_writer.as_ref() else {
            return;
        };
        let wrote = self.write_line(payload, Some(writer), TelemetryKind::Audit);
        if wrote && self.should_log_stdout() {
            tracing::info!(
                target = "telemetry",
                event = "audit",
                category = log.category,
                caller = ?log.caller,
            );
        }
    }

    pub fn lines_total(&self) -> &Arc<AtomicU64> {
        &self.metric_lines_total
    }

    pub fn write_errors_total(&self) -> &Arc<AtomicU64> {
        &self.metric_write_errors_total
    }

    pub fn log_file_size_bytes(&self) -> &Arc<AtomicU64> {
        &self.log_file_size_bytes
    }

    fn write_line(
        &self,
        payload: &serde_json::Value,
        writer: Option<&Arc<Mutex<RotatingWriter>>>,
        kind: TelemetryKind,
    ) -> bool {
        let line = payload.to_string();
        if let Some(target) = writer {
            if let Ok(mut guard) = target.lock() {
                match guard.write_line_result(&line) {
                    Ok(_) => {
                        self.metric_lines_total.fetch_add(1, Ordering::Relaxed);
                        if let Some(sz) = guard.current_size() {
                            self.log_file_size_bytes.store(sz, Ordering::Relaxed);
                        }
                        return true;
                    }
                    Err(e) => {
                        match kind {
                            TelemetryKind::Event => {
                                tracing::warn!(error=%e, "Failed to write telemetry line");
                            }
                            TelemetryKind::Audit => {
                                tracing::warn!(error=%e, "Failed to write audit line");
                            }
                        }
                        self.metric_write_errors_total
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        false
    }

    fn should_log_stdout(&self) -> bool {
        if !self.log_stdout {
            return false;
        }
        if let Some(n) = self.log_sample_n {
            let prev = self.log_sample_counter.fetch_add(1, Ordering::Relaxed);
            prev % n == 0
        } else {
            true
        }
    }
}

/// Build state from environment variables.  See `AppConfig::from_env` for
/// the recognized variables.  Fails fast if the static tool-contract table
/// is inconsistent.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    dispatch::verify_contracts()
        .map_err(|e| -> Box<dyn std::error::Error> { format!("tool contract table invalid: {e}").into() })?;

    if config.api_key.is_none() {
        tracing::warn!("GENGUARD_API_KEY not set; upstream calls will carry no credentials");
    }

    // Fixed histogram bucket upper bounds in ms. Upstream completion calls
    // dominate, hence the long tail.
    let buckets: Vec<u64> = vec![5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

    let event_writer = match config.log_file.as_deref() {
        Some(path) => match RotatingWriter::open(
            path,
            config.rotation.max_bytes,
            config.rotation.keep,
            config.rotation.compress,
        ) {
            Ok(f) => Some(Arc::new(Mutex::new(f))),
            Err(e) => {
                tracing::warn!(path=%path, error=%e, "Failed to open LOG_FILE for telemetry; telemetry disabled");
                None
            }
        },
        None => {
            tracing::warn!("Telemetry disabled: LOG_FILE not set");
            None
        }
    };
    let audit_writer = match config.audit_log_file.as_deref() {
        Some(path) => match RotatingWriter::open(
            path,
            config.rotation.max_bytes,
            config.rotation.keep,
            config.rotation.compress,
        ) {
            Ok(f) => Some(Arc::new(Mutex::new(f))),
            Err(e) => {
                tracing::warn!(path=%path, error=%e, "Failed to open AUDIT_LOG_FILE; audit records will fall back or be disabled");
                None
            }
        },
        None => None,
    };

    let metric_lines_total = Arc::new(AtomicU64::new(0));
    let metric_write_errors_total = Arc::new(AtomicU64::new(0));
    let log_file_size_bytes = Arc::new(AtomicU64::new(0));

    let telemetry = TelemetrySink::new(
        event_writer,
        audit_writer,
        config.log_stdout,
        config.log_sample_n,
        metric_lines_total,
        metric_write_errors_total,
        log_file_size_bytes,
    );

    // One rejection counter per taxonomy category.
    let mut index_map = std::collections::HashMap::new();
    let mut rejection_counts = Vec::new();
    for (i, name) in error::CATEGORIES.iter().enumerate() {
        index_map.insert(*name, i);
        rejection_counts.push(AtomicU64::new(0));
    }

    let dispatcher = GenerationDispatcher::new(
        config.completion_url.clone(),
        config.api_key.clone(),
        config.model.clone(),
        config.upstream_timeout_ms,
    );

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    Ok(AppState {
        limiter: RateLimiter::new(config.rate),
        dispatcher: Arc::new(dispatcher),
        scan_config: config.scan_config,
        max_request_bytes: config.max_request_bytes,
        allowed_tokens: config.allowed_tokens,
        telemetry,
        metric_requests_total: Arc::new(AtomicU64::new(0)),
        rejection_category_indices: Arc::new(index_map),
        rejection_counts: Arc::new(rejection_counts),
        hist_buckets: Arc::new(buckets.clone()),
        hist_counts: Arc::new(buckets.iter().map(|_| AtomicU64::new(0)).collect()),
        hist_sum_ms: Arc::new(AtomicU64::new(0)),
        hist_count: Arc::new(AtomicU64::new(0)),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    })
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    Router::new()
        .route("/v1/generate", post(generate_handler).options(preflight_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("strict-transport-security", "max-age=63072000; includeSubDomains"),
    ("content-security-policy", "default-src 'none'"),
    ("access-control-allow-origin", "*"),
    ("access-control-allow-headers", "authorization, content-type"),
    ("access-control-allow-methods", "POST, OPTIONS"),
];

fn apply_security_headers(headers: &mut HeaderMap) {
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(name, v);
    }
}

fn observe_latency(state: &AppState, latency_ms: u64) {
    state.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    state.hist_count.fetch_add(1, Ordering::Relaxed);
    for (idx, ub) in state.hist_buckets.iter().enumerate() {
        if latency_ms <= *ub {
            state.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
            break;
        }
    }
}

/// Compose the wire form of a rejection: `{error, details?, retryAfter?}`
/// plus security headers and, for 429s, a Retry-After header.
fn respond_with_error(err: &GateError) -> axum::response::Response {
    let mut body = serde_json::json!({ "error": err.to_string() });
    if let Some(labels) = err.threat_labels() {
        body["details"] = labels
            .iter()
            .map(|l| serde_json::Value::String(l.as_str().to_string()))
            .collect();
    }
    if let Some(retry) = err.retry_after_secs() {
        body["retryAfter"] = retry.into();
    }
    let mut response = (err.status(), Json(body)).into_response();
    apply_security_headers(response.headers_mut());
    if let Some(retry) = err.retry_after_secs() {
        insert_header(response.headers_mut(), "retry-after", retry.to_string());
    }
    response
}

/// Terminal rejection path: count it, log it, record the audit event, then
/// answer.  The telemetry sink never blocks the response.
fn reject(
    state: &AppState,
    caller: Option<&str>,
    err: GateError,
    started: Instant,
) -> axum::response::Response {
    let latency_ms = started.elapsed().as_millis();
    observe_latency(state, latency_ms as u64);
    let category = err.category();
    if let Some(idx) = state.rejection_category_indices.get(category) {
        if let Some(counter) = state.rejection_counts.get(*idx) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
    match err.internal_detail() {
        Some(detail) => {
            tracing::warn!(category, detail, caller = ?caller, "gate rejection")
        }
        None => tracing::info!(category, caller = ?caller, "gate rejection"),
    }

    let record = serde_json::json!({
        "schemaVersion": 1,
        "ts": chrono::Utc::now().to_rfc3339(),
        "caller": caller,
        "outcome": "rejected",
        "category": category,
        "status": err.status().as_u16(),
        "retryAfter": err.retry_after_secs(),
        "labels": err.threat_labels().map(|ls| {
            ls.iter().map(|l| l.as_str()).collect::<Vec<_>>()
        }),
        "latencyMs": latency_ms,
    });
    state.telemetry.emit_audit(&record, &AuditLogFields { category, caller });
    state.telemetry.emit_event(
        &record,
        &EventLogFields {
            allowed: false,
            category: Some(category),
            caller,
            latency_ms,
        },
    );

    respond_with_error(&err)
}

/// Success path: the validated generation result verbatim, decorated with
/// the caller's current rate-limit state and the fixed security headers.
fn respond_success(
    state: &AppState,
    caller: &str,
    kind: GenerationKind,
    result: serde_json::Value,
    started: Instant,
) -> axum::response::Response {
    let latency_ms = started.elapsed().as_millis();
    observe_latency(state, latency_ms as u64);
    let snapshot = state.limiter.snapshot(caller, util::epoch_ms());

    let event = serde_json::json!({
        "schemaVersion": 1,
        "ts": chrono::Utc::now().to_rfc3339(),
        "caller": caller,
        "outcome": "allowed",
        "kind": kind.as_str(),
        "rateRemaining": snapshot.remaining,
        "latencyMs": latency_ms,
    });
    state.telemetry.emit_event(
        &event,
        &EventLogFields {
            allowed: true,
            category: None,
            caller: Some(caller),
            latency_ms,
        },
    );

    let mut response = (StatusCode::OK, Json(result)).into_response();
    let headers = response.headers_mut();
    apply_security_headers(headers);
    insert_header(headers, "x-ratelimit-limit", snapshot.limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", snapshot.remaining.to_string());
    if let Some(reset) = chrono::DateTime::from_timestamp_millis(snapshot.reset_at_ms as i64) {
        insert_header(headers, "x-ratelimit-reset", reset.to_rfc3339());
    }
    response
}

fn body_rejection_error(state: &AppState, rejection: BytesRejection) -> GateError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            tracing::warn!(limit = state.max_request_bytes, "request body exceeded configured limit");
            GateError::PayloadTooLarge {
                measured: state.max_request_bytes + 1,
                limit: state.max_request_bytes,
            }
        }
        other => GateError::Malformed(format!("unreadable request body: {other}")),
    }
}

/// Handler for `POST /v1/generate`.  Runs the gate stages in their fixed
/// order, short-circuiting on the first failure, then forwards the cleaned
/// prompt to the dispatcher.
async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> axum::response::Response {
    let started = Instant::now();
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);
    let now_ms = util::epoch_ms();

    // 1. Caller identity.
    let caller = match auth::caller_identity(&headers, state.allowed_tokens.as_ref()) {
        Ok(caller) => caller,
        Err(err) => return reject(&state, None, err, started),
    };

    // 2. Admission control, spacing before quota.
    match state.limiter.admit(&caller, now_ms) {
        RateDecision::Admitted { .. } => {}
        RateDecision::TooFrequent { retry_after_secs } => {
            let err = GateError::RateLimited {
                message: format!(
                    "Requests are arriving too quickly; wait {retry_after_secs}s between attempts"
                ),
                retry_after_secs,
            };
            return reject(&state, Some(&caller), err, started);
        }
        RateDecision::QuotaExceeded { retry_after_secs } => {
            let err = GateError::RateLimited {
                message: format!(
                    "Request quota exceeded for the current window; retry in {retry_after_secs}s"
                ),
                retry_after_secs,
            };
            return reject(&state, Some(&caller), err, started);
        }
    }

    // 3. Raw size, before any parsing. The Content-Length guard answers
    // oversized uploads without relying on the buffered body.
    if let Some(declared) = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        let check = validate::payload_size(declared, state.max_request_bytes);
        if !check.valid {
            let err = GateError::PayloadTooLarge {
                measured: check.measured,
                limit: state.max_request_bytes,
            };
            return reject(&state, Some(&caller), err, started);
        }
    }
    let bytes = match body {
        Ok(bytes) => bytes,
        Err(rejection) => {
            let err = body_rejection_error(&state, rejection);
            return reject(&state, Some(&caller), err, started);
        }
    };
    let raw_check = validate::payload_size(bytes.len(), state.max_request_bytes);
    if !raw_check.valid {
        let err = GateError::PayloadTooLarge {
            measured: raw_check.measured,
            limit: state.max_request_bytes,
        };
        return reject(&state, Some(&caller), err, started);
    }

    // 4. Parse.
    let parsed: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => {
            let err = GateError::Malformed("request body is not valid JSON".to_string());
            return reject(&state, Some(&caller), err, started);
        }
    };

    // 5. Size of the re-serialized structure; some inputs re-serialize
    // larger than they arrived.
    let reserialized = serde_json::to_vec(&parsed)
        .map(|v| v.len())
        .unwrap_or(bytes.len());
    let parsed_check = validate::payload_size(reserialized, state.max_request_bytes);
    if !parsed_check.valid {
        let err = GateError::PayloadTooLarge {
            measured: parsed_check.measured,
            limit: state.max_request_bytes,
        };
        return reject(&state, Some(&caller), err, started);
    }

    // 6. Generation kind.
    let kind = match validate::request_type(parsed.get("type")) {
        Ok(kind) => kind,
        Err(msg) => return reject(&state, Some(&caller), GateError::Malformed(msg), started),
    };

    // 7. Prompt presence and type, before length.
    let prompt = match validate::prompt_field(parsed.get("prompt")) {
        Ok(prompt) => prompt,
        Err(msg) => return reject(&state, Some(&caller), GateError::Malformed(msg), started),
    };

    // 8. Prompt length bounds.
    let length_check = validate::prompt_length(prompt);
    if !length_check.valid {
        let msg = length_check
            .reason
            .unwrap_or_else(|| "prompt length out of bounds".to_string());
        return reject(&state, Some(&caller), GateError::Malformed(msg), started);
    }

    // 9. Threat screening.
    let labels = scanner::detect_threats_with(prompt, &state.scan_config);
    if !labels.is_empty() {
        return reject(
            &state,
            Some(&caller),
            GateError::ThreatDetected { labels },
            started,
        );
    }

    // 10. Sanitize and dispatch.
    let clean = util::sanitize_prompt(prompt);
    match state.dispatcher.dispatch(kind, &clean).await {
        Ok(result) => respond_success(&state, &caller, kind, result, started),
        Err(err) => reject(&state, Some(&caller), err, started),
    }
}

/// CORS preflight: security headers only, no body.
async fn preflight_handler() -> axum::response::Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_security_headers(response.headers_mut());
    response
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let policy = state.limiter.policy();
    let json = serde_json::json!({
        "status": "ok",
        "maxRequestBytes": state.max_request_bytes,
        "rateWindowMs": policy.window_ms,
        "rateMaxRequests": policy.max_requests,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buf = String::new();
    use std::fmt::Write as _;
    let requests = state.metric_requests_total.load(Ordering::Relaxed);
    let telem = state.telemetry.lines_total().load(Ordering::Relaxed);
    let telem_errs = state.telemetry.write_errors_total().load(Ordering::Relaxed);
    let sum_ms = state.hist_sum_ms.load(Ordering::Relaxed);
    let count = state.hist_count.load(Ordering::Relaxed);
    let log_size = state.telemetry.log_file_size_bytes().load(Ordering::Relaxed);
    let uptime_secs = state.process_start_instant.elapsed().as_secs_f64();

    writeln!(
        &mut buf,
        "# HELP genguard_requests_total Total generation requests received"
    )
    .ok();
    writeln!(&mut buf, "# TYPE genguard_requests_total counter").ok();
    writeln!(&mut buf, "genguard_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP genguard_rejections_total Gate rejections by taxonomy category\n# TYPE genguard_rejections_total counter"
    )
    .ok();
    for (name, idx) in state.rejection_category_indices.iter() {
        if let Some(counter) = state.rejection_counts.get(*idx) {
            writeln!(
                &mut buf,
                "genguard_rejections_total{{category=\"{}\"}} {}",
                name,
                counter.load(Ordering::Relaxed)
            )
            .ok();
        }
    }
    writeln!(
        &mut buf,
        "# HELP genguard_telemetry_lines_total Telemetry/audit JSON lines written"
    )
    .ok();
    writeln!(&mut buf, "# TYPE genguard_telemetry_lines_total counter").ok();
    writeln!(&mut buf, "genguard_telemetry_lines_total {}", telem).ok();
    writeln!(
        &mut buf,
        "# HELP genguard_telemetry_write_errors_total Telemetry/audit JSON line write failures"
    )
    .ok();
    writeln!(&mut buf, "# TYPE genguard_telemetry_write_errors_total counter").ok();
    writeln!(&mut buf, "genguard_telemetry_write_errors_total {}", telem_errs).ok();
    writeln!(
        &mut buf,
        "# HELP genguard_request_latency_ms Request latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE genguard_request_latency_ms histogram").ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in state.hist_buckets.iter().enumerate() {
        let c = state.hist_counts[i].load(Ordering::Relaxed);
        cumulative += c;
        writeln!(
            &mut buf,
            "genguard_request_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "genguard_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(&mut buf, "genguard_request_latency_ms_sum {}", sum_ms).ok();
    writeln!(&mut buf, "genguard_request_latency_ms_count {}", count).ok();
    writeln!(
        &mut buf,
        "# HELP genguard_build_info Build information\n# TYPE genguard_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "genguard_build_info{{version=\"{}\",schemaVersion=\"1\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP genguard_log_file_size_bytes Current size in bytes of active telemetry log file (0 if disabled)\n# TYPE genguard_log_file_size_bytes gauge"
    )
    .ok();
    writeln!(&mut buf, "genguard_log_file_size_bytes {}", log_size).ok();
    writeln!(
        &mut buf,
        "# HELP genguard_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE genguard_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "genguard_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP genguard_process_uptime_seconds Process uptime seconds\n# TYPE genguard_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(&mut buf, "genguard_process_uptime_seconds {}", uptime_secs).ok();

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
