use delve_core::BackendError;
use std::time::Duration;

/// Exponential backoff: `min(base * growth^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub growth: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, growth: f64, max: Duration) -> Self {
        Self { base, growth, max }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base.as_secs_f64() * self.growth.max(1.0).powi(exp);
        // f64::min drops NaN, and `max` is finite, so this never feeds a non-finite value below.
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()).max(0.0))
    }

    /// Upper bound on time spent sleeping across `attempts` retries.
    pub fn ceiling(&self, attempts: u32) -> Duration {
        (1..=attempts).map(|a| self.delay(a)).sum()
    }
}

/// Suspension point used for every backoff and poll wait.
///
/// Production code sleeps on the tokio timer; tests substitute a recorder.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

pub const DEFAULT_RETRYABLE_ERRORS: [&str; 14] = [
    "gateway_timeout",
    "deadline_expired",
    "timeout",
    "timed out",
    "connection_reset",
    "connection reset",
    "reset by peer",
    "broken pipe",
    "closed",
    "aborted",
    "internal_error",
    "service_unavailable",
    "unavailable",
    "overloaded",
];

/// Turns raw adapter failures into tagged [`BackendError`]s.
///
/// This is the only place error text is inspected; it runs inside the adapter so the engine
/// never string-matches.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    keywords: Vec<String>,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()))
    }
}

impl RetryClassifier {
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    /// `DELVE_RETRYABLE_ERRORS` (comma-separated) replaces the built-in list when set.
    pub fn from_env() -> Self {
        match crate::config::env("DELVE_RETRYABLE_ERRORS") {
            Some(v) => Self::new(v.split(',').map(|s| s.to_string())),
            None => Self::default(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_retryable_message(&self, msg: &str) -> bool {
        let lower = msg.to_ascii_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    pub fn classify(&self, msg: impl Into<String>) -> BackendError {
        let msg = msg.into();
        if self.is_retryable_message(&msg) {
            BackendError::Retryable(msg)
        } else {
            BackendError::Fatal(msg)
        }
    }

    /// Non-2xx responses: 408 and the 5xx class are retryable regardless of body.
    pub fn classify_status(&self, status: u16, body: &str) -> BackendError {
        let snippet: String = body.chars().take(300).collect();
        let msg = format!("HTTP {status}: {}", snippet.trim());
        if status == 408 || (500..600).contains(&status) {
            BackendError::Retryable(msg)
        } else {
            self.classify(msg)
        }
    }

    pub fn classify_reqwest(&self, e: &reqwest::Error) -> BackendError {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return BackendError::Retryable(e.to_string());
        }
        if let Some(status) = e.status() {
            return self.classify_status(status.as_u16(), &e.to_string());
        }
        self.classify(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let b = Backoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(10));
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(3), Duration::from_secs(8));
        assert_eq!(b.delay(4), Duration::from_secs(10));
        assert_eq!(b.delay(400), Duration::from_secs(10));
        assert_eq!(b.ceiling(3), Duration::from_secs(14));
    }

    #[test]
    fn growth_below_one_does_not_shrink() {
        let b = Backoff::new(Duration::from_secs(3), 0.5, Duration::from_secs(60));
        assert_eq!(b.delay(5), Duration::from_secs(3));
    }

    #[test]
    fn keywords_decide_retryability() {
        let c = RetryClassifier::default();
        assert!(c.classify("504 GATEWAY_TIMEOUT upstream").is_retryable());
        assert!(c.classify("stream closed by server").is_retryable());
        assert!(!c.classify("API key not valid").is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let c = RetryClassifier::default();
        assert!(c.classify_status(503, "").is_retryable());
        assert!(c.classify_status(408, "").is_retryable());
        assert!(!c.classify_status(400, "bad input").is_retryable());
        assert!(!c.classify_status(404, "no such interaction").is_retryable());
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let c = RetryClassifier::new(vec![" Flaky ".to_string(), String::new()]);
        assert_eq!(c.keywords(), &["flaky".to_string()]);
        assert!(c.classify("FLAKY upstream").is_retryable());
        assert!(!c.classify("timeout").is_retryable());
    }
}
