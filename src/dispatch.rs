//! Generation dispatch against the AI completion provider.
//!
//! Each generation kind maps to a fixed [`ToolContract`]: a system prompt, a
//! declared function with a strict parameter schema, and the top-level keys
//! the returned arguments must carry.  The provider is forced through
//! `tool_choice` to answer with that function; anything else — free text, a
//! different function, malformed or wrong-kind arguments — is rejected
//! before it can reach the caller.
//!
//! The HTTP call itself sits behind [`CompletionBackend`] so the mapping and
//! validation logic is testable without a socket.  The real backend is a
//! `reqwest` client with a bounded timeout; hitting the deadline aborts the
//! outbound request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::GateError;
use crate::GenerationKind;

/// Provider endpoint used when no deploy-side override is configured.  The
/// URL is never derived from caller input.
pub const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// The static contract governing one generation kind.
pub struct ToolContract {
    pub kind: GenerationKind,
    pub function_name: &'static str,
    pub description: &'static str,
    pub system_prompt: &'static str,
    pub required_keys: &'static [&'static str],
}

pub static CONTRACTS: [ToolContract; 3] = [
    ToolContract {
        kind: GenerationKind::Features,
        function_name: "generate_features",
        description: "Record exactly three product features derived from the business objective.",
        system_prompt: "You are a senior product strategist. Given a business objective, \
            propose exactly 3 concrete product features that advance it. For each feature \
            give a short title, a two-to-three sentence description, and rate both expected \
            impact and implementation effort as Low, Medium or High. Ground every feature in \
            the stated objective; do not invent unrelated capabilities.",
        required_keys: &["features"],
    },
    ToolContract {
        kind: GenerationKind::Kpis,
        function_name: "generate_kpis",
        description: "Record exactly six key performance indicators for the business objective.",
        system_prompt: "You are an analytics lead. Given a business objective, define exactly \
            6 key performance indicators that would demonstrate progress against it. For each \
            KPI give a concise name and a one-sentence description of what it measures and why \
            it matters for the objective.",
        required_keys: &["kpis"],
    },
    ToolContract {
        kind: GenerationKind::Implementation,
        function_name: "generate_implementation_plan",
        description: "Record a four-phase implementation plan with analytics tracking events.",
        system_prompt: "You are a delivery lead. Given a business objective, lay out an \
            implementation plan of exactly 4 phased steps. Each step needs a phase name, an \
            estimated duration, at least 3 concrete tasks and at least 2 deliverables. Also \
            define at least 4 analytics tracking events (name, description, and at least 2 \
            event parameters each) that instrument progress toward the objective.",
        required_keys: &["steps", "trackingEvents"],
    },
];

impl ToolContract {
    pub fn for_kind(kind: GenerationKind) -> &'static ToolContract {
        match kind {
            GenerationKind::Features => &CONTRACTS[0],
            GenerationKind::Kpis => &CONTRACTS[1],
            GenerationKind::Implementation => &CONTRACTS[2],
        }
    }

    /// Assert the static table entry is internally consistent.  Defends
    /// against a bad edit to the table; callers surface a failure as a
    /// configuration error, not a schema violation.
    pub fn self_check(&self) -> Result<(), String> {
        let expected = match self.kind {
            GenerationKind::Features => "generate_features",
            GenerationKind::Kpis => "generate_kpis",
            GenerationKind::Implementation => "generate_implementation_plan",
        };
        if self.function_name != expected {
            return Err(format!(
                "contract for {:?} declares function {:?}, expected {:?}",
                self.kind, self.function_name, expected
            ));
        }
        if self.required_keys.is_empty() {
            return Err(format!("contract for {:?} declares no required keys", self.kind));
        }
        let schema = self.parameters_schema();
        let declared: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for key in self.required_keys {
            if !declared.contains(key) {
                return Err(format!(
                    "contract for {:?} requires key {key:?} absent from its schema",
                    self.kind
                ));
            }
        }
        Ok(())
    }

    /// JSON schema for the declared function's parameters.
    pub fn parameters_schema(&self) -> Value {
        let level = json!({"type": "string", "enum": ["Low", "Medium", "High"]});
        match self.kind {
            GenerationKind::Features => json!({
                "type": "object",
                "properties": {
                    "features": {
                        "type": "array",
                        "minItems": 3,
                        "maxItems": 3,
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": {"type": "string"},
                                "description": {"type": "string"},
                                "impact": level.clone(),
                                "effort": level
                            },
                            "required": ["title", "description", "impact", "effort"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["features"],
                "additionalProperties": false
            }),
            GenerationKind::Kpis => json!({
                "type": "object",
                "properties": {
                    "kpis": {
                        "type": "array",
                        "minItems": 6,
                        "maxItems": 6,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "description": {"type": "string"}
                            },
                            "required": ["name", "description"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["kpis"],
                "additionalProperties": false
            }),
            GenerationKind::Implementation => json!({
                "type": "object",
                "properties": {
                    "steps": {
                        "type": "array",
                        "minItems": 4,
                        "maxItems": 4,
                        "items": {
                            "type": "object",
                            "properties": {
                                "phase": {"type": "string"},
                                "duration": {"type": "string"},
                                "tasks": {"type": "array", "minItems": 3, "items": {"type": "string"}},
                                "deliverables": {"type": "array", "minItems": 2, "items": {"type": "string"}}
                            },
                            "required": ["phase", "duration", "tasks", "deliverables"],
                            "additionalProperties": false
                        }
                    },
                    "trackingEvents": {
                        "type": "array",
                        "minItems": 4,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "description": {"type": "string"},
                                "parameters": {"type": "array", "minItems": 2, "items": {"type": "string"}}
                            },
                            "required": ["name", "description", "parameters"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["steps", "trackingEvents"],
                "additionalProperties": false
            }),
        }
    }

    /// Shape-check returned arguments against this contract.  A payload that
    /// is well-formed for a *different* kind fails here on its missing keys.
    pub fn validate_arguments(&self, args: &Value) -> Result<(), String> {
        if !args.is_object() {
            return Err("tool arguments must be a JSON object".to_string());
        }
        match self.kind {
            GenerationKind::Features => {
                let features = expect_array(args, "features", Some(3), None)?;
                for (i, item) in features.iter().enumerate() {
                    let ctx = format!("features[{i}]");
                    expect_str(item, "title", &ctx)?;
                    expect_str(item, "description", &ctx)?;
                    expect_level(item, "impact", &ctx)?;
                    expect_level(item, "effort", &ctx)?;
                }
            }
            GenerationKind::Kpis => {
                let kpis = expect_array(args, "kpis", Some(6), None)?;
                for (i, item) in kpis.iter().enumerate() {
                    let ctx = format!("kpis[{i}]");
                    expect_str(item, "name", &ctx)?;
                    expect_str(item, "description", &ctx)?;
                }
            }
            GenerationKind::Implementation => {
                let steps = expect_array(args, "steps", Some(4), None)?;
                for (i, item) in steps.iter().enumerate() {
                    let ctx = format!("steps[{i}]");
                    expect_str(item, "phase", &ctx)?;
                    expect_str(item, "duration", &ctx)?;
                    expect_str_list(item, "tasks", 3, &ctx)?;
                    expect_str_list(item, "deliverables", 2, &ctx)?;
                }
                let events = expect_array(args, "trackingEvents", None, Some(4))?;
                for (i, item) in events.iter().enumerate() {
                    let ctx = format!("trackingEvents[{i}]");
                    expect_str(item, "name", &ctx)?;
                    expect_str(item, "description", &ctx)?;
                    expect_str_list(item, "parameters", 2, &ctx)?;
                }
            }
        }
        Ok(())
    }
}

fn expect_array<'a>(
    args: &'a Value,
    key: &str,
    exact: Option<usize>,
    min: Option<usize>,
) -> Result<&'a Vec<Value>, String> {
    let arr = args
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("missing required array {key:?}"))?;
    if let Some(n) = exact {
        if arr.len() != n {
            return Err(format!("{key:?} must contain exactly {n} items, got {}", arr.len()));
        }
    }
    if let Some(n) = min {
        if arr.len() < n {
            return Err(format!("{key:?} must contain at least {n} items, got {}", arr.len()));
        }
    }
    Ok(arr)
}

fn expect_str(item: &Value, key: &str, ctx: &str) -> Result<(), String> {
    match item.get(key).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(format!("{ctx}.{key} must be a non-empty string")),
    }
}

fn expect_level(item: &Value, key: &str, ctx: &str) -> Result<(), String> {
    match item.get(key).and_then(Value::as_str) {
        Some("Low") | Some("Medium") | Some("High") => Ok(()),
        _ => Err(format!("{ctx}.{key} must be one of Low, Medium, High")),
    }
}

fn expect_str_list(item: &Value, key: &str, min: usize, ctx: &str) -> Result<(), String> {
    let arr = item
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("{ctx}.{key} must be an array"))?;
    if arr.len() < min {
        return Err(format!("{ctx}.{key} must contain at least {min} entries"));
    }
    if !arr.iter().all(|v| v.as_str().is_some_and(|s| !s.trim().is_empty())) {
        return Err(format!("{ctx}.{key} entries must be non-empty strings"));
    }
    Ok(())
}

/// Validate the whole static contract table.  Run once at startup.
pub fn verify_contracts() -> Result<(), String> {
    for contract in &CONTRACTS {
        contract.self_check()?;
    }
    Ok(())
}

#[derive(Debug)]
pub enum BackendError {
    Timeout,
    Transport(String),
}

pub struct BackendResponse {
    pub status: u16,
    pub body: String,
}

/// Seam over the completion endpoint.  The production impl is HTTP; tests
/// substitute canned responses.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, body: &Value) -> Result<BackendResponse, BackendError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(url: String, api_key: Option<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            url,
            api_key,
        }
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(err.to_string())
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(&self, body: &Value) -> Result<BackendResponse, BackendError> {
        let mut rb = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.json(body).send().await.map_err(classify_transport)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(classify_transport)?;
        Ok(BackendResponse { status, body: text })
    }
}

pub struct GenerationDispatcher {
    backend: Arc<dyn CompletionBackend>,
    model: String,
}

impl GenerationDispatcher {
    pub fn new(url: String, api_key: Option<String>, model: String, timeout_ms: u64) -> Self {
        Self {
            backend: Arc::new(HttpBackend::new(url, api_key, timeout_ms)),
            model,
        }
    }

    pub fn with_backend(backend: Arc<dyn CompletionBackend>, model: String) -> Self {
        Self { backend, model }
    }

    /// Issue the forced tool call for `kind` and return the validated
    /// arguments object.
    pub async fn dispatch(
        &self,
        kind: GenerationKind,
        prompt: &str,
    ) -> Result<Value, GateError> {
        let contract = ToolContract::for_kind(kind);
        contract.self_check().map_err(GateError::Configuration)?;

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": contract.system_prompt},
                {"role": "user", "content": prompt}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": contract.function_name,
                    "description": contract.description,
                    "parameters": contract.parameters_schema()
                }
            }],
            "tool_choice": {"type": "function", "function": {"name": contract.function_name}}
        });

        let resp = self.backend.complete(&body).await.map_err(|e| match e {
            BackendError::Timeout => GateError::UpstreamTimeout,
            BackendError::Transport(detail) => GateError::UpstreamFailure(detail),
        })?;

        match resp.status {
            429 => return Err(GateError::UpstreamRateLimited),
            402 => return Err(GateError::UpstreamPaymentRequired),
            s if !(200..300).contains(&s) => {
                return Err(GateError::UpstreamFailure(format!(
                    "provider returned status {s}"
                )))
            }
            _ => {}
        }

        let parsed: Value = serde_json::from_str(&resp.body)
            .map_err(|e| GateError::SchemaViolation(format!("provider body is not JSON: {e}")))?;
        let tool_call = parsed
            .pointer("/choices/0/message/tool_calls/0")
            .ok_or_else(|| {
                GateError::SchemaViolation("no structured tool invocation in provider response".into())
            })?;
        let name = tool_call
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if name != contract.function_name {
            return Err(GateError::SchemaViolation(format!(
                "provider invoked {name:?}, expected {:?}",
                contract.function_name
            )));
        }
        let raw_args = tool_call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::SchemaViolation("tool invocation carries no arguments".into()))?;
        let args: Value = serde_json::from_str(raw_args)
            .map_err(|e| GateError::SchemaViolation(format!("tool arguments are not valid JSON: {e}")))?;
        contract
            .validate_arguments(&args)
            .map_err(GateError::SchemaViolation)?;
        Ok(args)
    }
}
