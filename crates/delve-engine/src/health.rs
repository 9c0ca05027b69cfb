use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthLimits {
    pub max_age: Duration,
    /// 0 = unlimited.
    pub max_requests: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthLimits {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(1800),
            max_requests: 0,
            max_consecutive_failures: 3,
        }
    }
}

impl HealthLimits {
    pub fn max_idle(&self) -> Duration {
        self.max_age / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    MaxAge(Duration),
    MaxRequests(u64),
    ConsecutiveFailures(u32),
    Idle(Duration),
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxAge(age) => write!(f, "age {}s over limit", age.as_secs()),
            Self::MaxRequests(n) => write!(f, "{n} requests reached the cap"),
            Self::ConsecutiveFailures(n) => write!(f, "{n} consecutive failures"),
            Self::Idle(idle) => write!(f, "idle for {}s", idle.as_secs()),
        }
    }
}

/// Usage record for one logical connection.
///
/// Only `record_success` and `record_failure` mutate it; `consecutive_failures` drops to 0
/// on any success.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    created_at: Instant,
    last_request_at: Instant,
    request_count: u64,
    consecutive_failures: u32,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(now: Instant) -> Self {
        Self {
            created_at: now,
            last_request_at: now,
            request_count: 0,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&mut self, now: Instant) {
        self.request_count += 1;
        self.last_request_at = now;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_request_at.elapsed()
    }

    pub fn refresh_reason_at(&self, now: Instant, limits: &HealthLimits) -> Option<RefreshReason> {
        let age = now.saturating_duration_since(self.created_at);
        if age > limits.max_age {
            return Some(RefreshReason::MaxAge(age));
        }
        if limits.max_requests > 0 && self.request_count >= limits.max_requests {
            return Some(RefreshReason::MaxRequests(self.request_count));
        }
        if self.consecutive_failures >= limits.max_consecutive_failures {
            return Some(RefreshReason::ConsecutiveFailures(self.consecutive_failures));
        }
        let idle = now.saturating_duration_since(self.last_request_at);
        if idle > limits.max_idle() {
            return Some(RefreshReason::Idle(idle));
        }
        None
    }

    pub fn refresh_reason(&self, limits: &HealthLimits) -> Option<RefreshReason> {
        self.refresh_reason_at(Instant::now(), limits)
    }

    pub fn needs_refresh(&self, limits: &HealthLimits) -> bool {
        self.refresh_reason(limits).is_some()
    }
}
