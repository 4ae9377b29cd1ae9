//! Shared helpers for integration tests: environment guarding, credential
//! minting, app spawning and a configurable stub completion provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use axum::{routing::post, Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    #[allow(dead_code)]
    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.iter().any(|(k, _)| k == key) {
            return;
        }
        self.originals
            .push((key.to_string(), std::env::var(key).ok()));
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        while let Some((key, original)) = self.originals.pop() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Mint an unsigned JWT-shaped credential carrying `sub`.  The gate only
/// decodes the payload segment; signatures are someone else's problem.
#[allow(dead_code)]
pub fn jwt_for(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "sub": sub }).to_string();
    let payload = URL_SAFE_NO_PAD.encode(claims.as_bytes());
    format!("{header}.{payload}.x")
}

#[allow(dead_code)]
pub fn bearer_for(sub: &str) -> String {
    format!("Bearer {}", jwt_for(sub))
}

/// Spawn the gate on an ephemeral port using whatever environment is set.
pub async fn spawn_app() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let state = genguard::build_state_from_env().await.unwrap();
    let app = genguard::app(state);
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// Behaviour of the stub completion provider.
#[allow(dead_code)]
#[derive(Clone)]
pub enum StubBehaviour {
    /// Answer 200 with a tool invocation of `function` carrying `arguments`.
    Tool {
        function: String,
        arguments: serde_json::Value,
    },
    /// Answer a bare status code with the given body.
    Status(u16, String),
    /// Sleep before answering; exercises the client-side deadline.
    Stall(Duration),
}

#[allow(dead_code)]
pub struct StubProvider {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
    pub handle: JoinHandle<()>,
}

/// Spin up a mock completion endpoint with the given behaviour.  Counts
/// every request it receives so tests can assert a call was (not) made.
#[allow(dead_code)]
pub async fn start_stub_provider(behaviour: StubBehaviour) -> StubProvider {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let behaviour = Arc::new(behaviour);

    let handler = move |Json(_body): Json<serde_json::Value>| {
        let behaviour = behaviour.clone();
        let hits = hits_clone.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            match behaviour.as_ref() {
                StubBehaviour::Tool {
                    function,
                    arguments,
                } => {
                    let body = serde_json::json!({
                        "choices": [{
                            "message": {
                                "tool_calls": [{
                                    "function": {
                                        "name": function,
                                        "arguments": arguments.to_string()
                                    }
                                }]
                            }
                        }]
                    });
                    (axum::http::StatusCode::OK, Json(body)).into_response()
                }
                StubBehaviour::Status(code, body) => {
                    let status = axum::http::StatusCode::from_u16(*code).unwrap();
                    (status, body.clone()).into_response()
                }
                StubBehaviour::Stall(delay) => {
                    tokio::time::sleep(*delay).await;
                    (axum::http::StatusCode::OK, "{}".to_string()).into_response()
                }
            }
        }
    };

    let app = Router::new().route("/v1/chat/completions", post(handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StubProvider {
        url: format!("http://{}/v1/chat/completions", addr),
        hits,
        handle,
    }
}

/// A features payload matching the `generate_features` contract.
#[allow(dead_code)]
pub fn three_features_args() -> serde_json::Value {
    serde_json::json!({
        "features": [
            {
                "title": "Guided workout plans",
                "description": "Curated plans matched to user goals.",
                "impact": "High",
                "effort": "Medium"
            },
            {
                "title": "Streak reminders",
                "description": "Push nudges that protect active streaks.",
                "impact": "Medium",
                "effort": "Low"
            },
            {
                "title": "Progress sharing",
                "description": "One-tap sharing of milestones.",
                "impact": "Medium",
                "effort": "Medium"
            }
        ]
    })
}
