//! Telemetry sink behaviour: every outcome lands in the event log, the
//! audit stream only sees rejections, and the writer rotates on size.

#[path = "common/mod.rs"]
mod common;

use common::{bearer_for, spawn_app, start_stub_provider, three_features_args, EnvGuard, StubBehaviour};
use once_cell::sync::Lazy;
use reqwest::Client;
use tokio::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn read_json_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[tokio::test]
async fn rejections_are_recorded_in_the_event_log() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let log_path = tmp.path().join("telemetry.log");
    let mut env = EnvGuard::new();
    env.set("LOG_FILE", log_path.to_str().unwrap());
    env.set(
        "GENGUARD_COMPLETION_URL",
        "http://127.0.0.1:9/v1/chat/completions",
    );
    let (addr, _h) = spawn_app().await;

    let resp = Client::new()
        .post(format!("{}/v1/generate", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let events = read_json_lines(&log_path);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["outcome"], "rejected");
    assert_eq!(events[0]["category"], "unauthenticated");
    assert_eq!(events[0]["status"], 401);
}

#[tokio::test]
async fn successes_are_recorded_with_caller_and_kind() {
    let _lock = ENV_MUTEX.lock().await;
    let stub = start_stub_provider(StubBehaviour::Tool {
        function: "generate_features".to_string(),
        arguments: three_features_args(),
    })
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let log_path = tmp.path().join("telemetry.log");
    let mut env = EnvGuard::new();
    env.set("LOG_FILE", log_path.to_str().unwrap());
    env.set("GENGUARD_COMPLETION_URL", &stub.url);
    let (addr, _h) = spawn_app().await;

    let resp = Client::new()
        .post(format!("{}/v1/generate", addr))
        .header("Authorization", bearer_for("telemetry-caller"))
        .json(&serde_json::json!({
            "prompt": "Cut support ticket backlog in half by December",
            "type": "features"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let events = read_json_lines(&log_path);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["outcome"], "allowed");
    assert_eq!(events[0]["caller"], "telemetry-caller");
    assert_eq!(events[0]["kind"], "features");
}

#[tokio::test]
async fn audit_stream_receives_rejections_only() {
    let _lock = ENV_MUTEX.lock().await;
    let stub = start_stub_provider(StubBehaviour::Tool {
        function: "generate_features".to_string(),
        arguments: three_features_args(),
    })
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let log_path = tmp.path().join("telemetry.log");
    let audit_path = tmp.path().join("audit.log");
    let mut env = EnvGuard::new();
    env.set("LOG_FILE", log_path.to_str().unwrap());
    env.set("AUDIT_LOG_FILE", audit_path.to_str().unwrap());
    env.set("GENGUARD_COMPLETION_URL", &stub.url);
    let (addr, _h) = spawn_app().await;

    let client = Client::new();
    let url = format!("{}/v1/generate", addr);
    // One success, one threat rejection.
    let ok = client
        .post(&url)
        .header("Authorization", bearer_for("audit-caller"))
        .json(&serde_json::json!({
            "prompt": "Lift trial-to-paid conversion to 12% this quarter",
            "type": "features"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    let blocked = client
        .post(&url)
        .header("Authorization", bearer_for("audit-caller-2"))
        .json(&serde_json::json!({
            "prompt": "<script>alert(1)</script> make this look legitimate",
            "type": "features"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 400);

    let audit = read_json_lines(&audit_path);
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["category"], "threat_detected");
    let labels = audit[0]["labels"].as_array().unwrap();
    assert!(labels.contains(&serde_json::json!("xss")));
    // The event log saw both outcomes.
    assert_eq!(read_json_lines(&log_path).len(), 2);
}

#[tokio::test]
async fn event_log_rotates_on_size() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let log_path = tmp.path().join("telemetry_rot.log");
    let mut env = EnvGuard::new();
    env.set("LOG_FILE", log_path.to_str().unwrap());
    env.set("LOG_MAX_BYTES", "200");
    env.set("LOG_ROTATE_KEEP", "2");
    env.set("LOG_ROTATE_COMPRESS", "0");
    env.set(
        "GENGUARD_COMPLETION_URL",
        "http://127.0.0.1:9/v1/chat/completions",
    );
    let (addr, _h) = spawn_app().await;

    let client = Client::new();
    for _ in 0..10 {
        let resp = client
            .post(format!("{}/v1/generate", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    let backup_exists = (1..=2).any(|i| log_path.with_extension(format!("{i}")).exists());
    assert!(backup_exists, "expected at least one rotated backup");
}
