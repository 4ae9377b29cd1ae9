use std::collections::HashSet;
use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::dispatch::{DEFAULT_COMPLETION_URL, DEFAULT_MODEL, DEFAULT_UPSTREAM_TIMEOUT_MS};
use crate::ratelimit::RatePolicy;
use crate::scanner::ScanConfig;
use crate::validate::MAX_PAYLOAD_BYTES;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scan_config: ScanConfig,
    pub log_file: Option<String>,
    pub audit_log_file: Option<String>,
    pub allowed_tokens: Option<HashSet<String>>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub log_sample_n: Option<u64>,
    pub max_request_bytes: usize,
    pub rate: RatePolicy,
    pub completion_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub upstream_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let scan_config = if let Ok(path) = env::var("GENGUARD_SCAN_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read GENGUARD_SCAN_CONFIG '{}': file unreadable", path)
            })?;
            serde_json::from_str::<ScanConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse GENGUARD_SCAN_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            ScanConfig::default()
        };

        let log_file = env::var("LOG_FILE").ok();
        let audit_log_file = env::var("AUDIT_LOG_FILE").ok();

        let allowed_tokens = env::var("GENGUARD_ALLOWED_TOKENS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .filter(|set: &HashSet<String>| !set.is_empty());

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let log_stdout = parse_bool_env("GENGUARD_LOG_STDOUT")?.unwrap_or(false);
        let log_sample_n = parse_optional_u64("GENGUARD_LOG_SAMPLE_N")?.filter(|n| *n > 1);
        let max_request_bytes = parse_optional_u64("GENGUARD_MAX_REQUEST_BYTES")?
            .map(|v| v as usize)
            .unwrap_or(MAX_PAYLOAD_BYTES);

        let defaults = RatePolicy::default();
        let rate = RatePolicy {
            window_ms: parse_optional_u64("GENGUARD_RATE_WINDOW_MS")?.unwrap_or(defaults.window_ms),
            max_requests: parse_optional_u64("GENGUARD_RATE_MAX_REQUESTS")?
                .map(|v| v as u32)
                .unwrap_or(defaults.max_requests),
            min_interval_ms: parse_optional_u64("GENGUARD_RATE_MIN_INTERVAL_MS")?
                .unwrap_or(defaults.min_interval_ms),
            sweep_threshold: defaults.sweep_threshold,
        };

        let completion_url = env::var("GENGUARD_COMPLETION_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string());
        let api_key = env::var("GENGUARD_API_KEY").ok().filter(|s| !s.is_empty());
        let model = env::var("GENGUARD_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let upstream_timeout_ms = parse_optional_u64("GENGUARD_UPSTREAM_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);

        Ok(Self {
            scan_config,
            log_file,
            audit_log_file,
            allowed_tokens,
            rotation,
            log_stdout,
            log_sample_n,
            max_request_bytes,
            rate,
            completion_url,
            api_key,
            model,
            upstream_timeout_ms,
        })
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: &[&str] = &[
        "GENGUARD_SCAN_CONFIG",
        "GENGUARD_ALLOWED_TOKENS",
        "LOG_FILE",
        "AUDIT_LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
        "LOG_ROTATE_COMPRESS",
        "GENGUARD_LOG_STDOUT",
        "GENGUARD_LOG_SAMPLE_N",
        "GENGUARD_MAX_REQUEST_BYTES",
        "GENGUARD_RATE_WINDOW_MS",
        "GENGUARD_RATE_MAX_REQUESTS",
        "GENGUARD_RATE_MIN_INTERVAL_MS",
        "GENGUARD_COMPLETION_URL",
        "GENGUARD_API_KEY",
        "GENGUARD_MODEL",
        "GENGUARD_UPSTREAM_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.log_file.is_none());
        assert_eq!(cfg.rotation.keep, 1);
        assert!(!cfg.log_stdout);
        assert_eq!(cfg.max_request_bytes, 50_000);
        assert_eq!(cfg.rate.window_ms, 60_000);
        assert_eq!(cfg.rate.max_requests, 10);
        assert_eq!(cfg.rate.min_interval_ms, 2_000);
        assert_eq!(cfg.completion_url, DEFAULT_COMPLETION_URL);
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.upstream_timeout_ms, 30_000);
        assert!(cfg.api_key.is_none());
        assert!(cfg.scan_config.injection_phrases.is_empty());
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let mut temp = NamedTempFile::new().unwrap();
        let config = serde_json::json!({
            "injectionPhrases": ["override the guardrails"],
            "ssrfMarkers": ["internal.corp"],
        });
        use std::io::Write;
        write!(temp, "{}", config).unwrap();

        std::env::set_var("GENGUARD_SCAN_CONFIG", temp.path());
        std::env::set_var("GENGUARD_ALLOWED_TOKENS", "tok-a,tok-b");
        std::env::set_var("LOG_FILE", "/tmp/genguard-telemetry.log");
        std::env::set_var("AUDIT_LOG_FILE", "/tmp/genguard-audit.log");
        std::env::set_var("LOG_MAX_BYTES", "1024");
        std::env::set_var("LOG_ROTATE_KEEP", "5");
        std::env::set_var("LOG_ROTATE_COMPRESS", "true");
        std::env::set_var("GENGUARD_LOG_STDOUT", "1");
        std::env::set_var("GENGUARD_LOG_SAMPLE_N", "4");
        std::env::set_var("GENGUARD_MAX_REQUEST_BYTES", "2048");
        std::env::set_var("GENGUARD_RATE_WINDOW_MS", "30000");
        std::env::set_var("GENGUARD_RATE_MAX_REQUESTS", "5");
        std::env::set_var("GENGUARD_RATE_MIN_INTERVAL_MS", "0");
        std::env::set_var("GENGUARD_COMPLETION_URL", "http://127.0.0.1:9999/v1/chat");
        std::env::set_var("GENGUARD_API_KEY", "sk-test");
        std::env::set_var("GENGUARD_MODEL", "test-model");
        std::env::set_var("GENGUARD_UPSTREAM_TIMEOUT_MS", "500");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(
            cfg.scan_config.injection_phrases,
            vec!["override the guardrails"]
        );
        assert_eq!(cfg.scan_config.ssrf_markers, vec!["internal.corp"]);
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/genguard-telemetry.log"));
        assert_eq!(cfg.audit_log_file.as_deref(), Some("/tmp/genguard-audit.log"));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 5);
        assert!(cfg.rotation.compress);
        assert!(cfg.log_stdout);
        assert_eq!(cfg.log_sample_n, Some(4));
        assert_eq!(cfg.max_request_bytes, 2048);
        assert_eq!(cfg.rate.window_ms, 30_000);
        assert_eq!(cfg.rate.max_requests, 5);
        assert_eq!(cfg.rate.min_interval_ms, 0);
        assert_eq!(cfg.completion_url, "http://127.0.0.1:9999/v1/chat");
        assert_eq!(cfg.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.model, "test-model");
        assert_eq!(cfg.upstream_timeout_ms, 500);
        let tokens = cfg.allowed_tokens.unwrap();
        assert!(tokens.contains("tok-a") && tokens.contains("tok-b"));

        clear_env();
    }

    #[test]
    fn rejects_non_numeric_tunables() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("GENGUARD_RATE_WINDOW_MS", "sixty seconds");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("GENGUARD_RATE_WINDOW_MS"));
        clear_env();
    }
}
