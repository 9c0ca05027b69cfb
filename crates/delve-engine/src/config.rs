use crate::health::HealthLimits;
use crate::retry::{Backoff, RetryClassifier};
use std::time::Duration;

pub const DEFAULT_AGENT: &str = "deep-research-pro-preview-12-2025";
pub const DEFAULT_QUICK_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_CRITIQUE_MODEL: &str = "gemini-3-pro-preview";
pub const DEFAULT_FACT_CHECK_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_FOLLOWUP_MODEL: &str = "gemini-3-pro-preview";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Trimmed env var; empty counts as unset.
pub fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match env(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64, min: u64, max: u64) -> u64 {
    env(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_millis(key: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(env_u64(key, default, min, max))
}

/// First non-empty value among `DELVE_GEMINI_API_KEY`, `GEMINI_API_KEY`, `GOOGLE_API_KEY`.
pub fn gemini_api_key_from_env() -> Option<String> {
    ["DELVE_GEMINI_API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .find_map(|k| env(k))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub quick: String,
    pub critique: String,
    pub fact_check: String,
    pub followup: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            quick: DEFAULT_QUICK_MODEL.to_string(),
            critique: DEFAULT_CRITIQUE_MODEL.to_string(),
            fact_check: DEFAULT_FACT_CHECK_MODEL.to_string(),
            followup: DEFAULT_FOLLOWUP_MODEL.to_string(),
        }
    }
}

impl ModelConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            quick: env("DELVE_MODEL").unwrap_or(d.quick),
            critique: env("DELVE_CRITIQUE_MODEL").unwrap_or(d.critique),
            fact_check: env("DELVE_FACT_CHECK_MODEL").unwrap_or(d.fact_check),
            followup: env("DELVE_FOLLOWUP_MODEL").unwrap_or(d.followup),
        }
    }
}

/// Knobs for the streaming engine and its refinement passes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_initial_retries: u32,
    pub max_stream_retries: u32,
    pub initial_backoff: Backoff,
    pub stream_backoff: Backoff,
    pub poll_interval: Duration,
    pub max_poll_time: Duration,
    /// Wall-clock ceiling for the streaming phase (connect + reconnects).
    pub stream_timeout: Duration,
    /// Silence on an open stream longer than this counts as a disconnect.
    pub stream_idle_timeout: Duration,
    /// Consecutive reconnect failures that force a fresh connection.
    pub invalidate_after_failures: u32,
    pub health: HealthLimits,
    pub models: ModelConfig,
    /// Ask refinement models for JSON replies (line scanning stays as fallback).
    pub structured_output: bool,
    pub critique_max_chars: usize,
    pub fact_check_max_chars: usize,
    pub max_followups: usize,
    pub max_fact_check_sources: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_initial_retries: 3,
            max_stream_retries: 5,
            initial_backoff: Backoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(30)),
            stream_backoff: Backoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(60)),
            poll_interval: Duration::from_secs(10),
            max_poll_time: Duration::from_secs(3600),
            stream_timeout: Duration::from_secs(3600),
            stream_idle_timeout: Duration::from_secs(300),
            invalidate_after_failures: 3,
            health: HealthLimits::default(),
            models: ModelConfig::default(),
            structured_output: true,
            critique_max_chars: 50_000,
            fact_check_max_chars: 30_000,
            max_followups: 3,
            max_fact_check_sources: 10,
        }
    }
}

impl EngineConfig {
    /// Read `DELVE_*` overrides. Out-of-range values are clamped rather than rejected.
    pub fn from_env() -> Self {
        let d = Self::default();
        let base = env_millis("DELVE_RETRY_BASE_DELAY_MS", 2_000, 0, 300_000);
        let growth = env("DELVE_RETRY_GROWTH")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(2.0)
            .clamp(1.0, 10.0);
        Self {
            max_initial_retries: env_u64("DELVE_MAX_INITIAL_RETRIES", 3, 1, 10) as u32,
            max_stream_retries: env_u64("DELVE_MAX_STREAM_RETRIES", 5, 1, 20) as u32,
            initial_backoff: Backoff::new(
                base,
                growth,
                env_millis("DELVE_MAX_INITIAL_RETRY_DELAY_MS", 30_000, 0, 600_000),
            ),
            stream_backoff: Backoff::new(
                base,
                growth,
                env_millis("DELVE_MAX_STREAM_RETRY_DELAY_MS", 60_000, 0, 600_000),
            ),
            poll_interval: env_millis("DELVE_POLL_INTERVAL_MS", 10_000, 100, 600_000),
            max_poll_time: Duration::from_secs(env_u64("DELVE_MAX_POLL_SECS", 3600, 1, 86_400)),
            stream_timeout: Duration::from_secs(env_u64("DELVE_TIMEOUT_SECS", 3600, 1, 86_400)),
            stream_idle_timeout: Duration::from_secs(env_u64("DELVE_STREAM_IDLE_SECS", 300, 10, 3600)),
            health: HealthLimits {
                max_age: Duration::from_secs(env_u64("DELVE_CLIENT_MAX_AGE_SECS", 1800, 1, 86_400)),
                max_requests: env_u64("DELVE_CLIENT_MAX_REQUESTS", 0, 0, u64::MAX),
                ..d.health
            },
            models: ModelConfig::from_env(),
            structured_output: env_bool("DELVE_STRUCTURED_OUTPUT", d.structured_output),
            ..d
        }
    }
}

/// Where and how to reach the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub agent: String,
    pub classifier: RetryClassifier,
}

impl GeminiConfig {
    pub fn from_env() -> delve_core::Result<Self> {
        let api_key = gemini_api_key_from_env().ok_or_else(|| {
            delve_core::Error::NotConfigured(
                "missing DELVE_GEMINI_API_KEY (or GEMINI_API_KEY / GOOGLE_API_KEY)".to_string(),
            )
        })?;
        Ok(Self {
            api_key,
            base_url: env("DELVE_GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            agent: env("DELVE_AGENT").unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            classifier: RetryClassifier::from_env(),
        })
    }
}
