use crate::config::EngineConfig;
use crate::pool::ConnectionPool;
use crate::refine::{LineScanParser, ReplyParser, StructuredReplyParser};
use crate::retry::{Sleeper, TokioSleeper};
use std::sync::Arc;

/// Entry point for streaming research, polling, refinement and the quick/follow-up calls.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct ResearchEngine {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) config: EngineConfig,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) parser: Arc<dyn ReplyParser>,
}

impl ResearchEngine {
    pub fn new(pool: Arc<ConnectionPool>, config: EngineConfig) -> Self {
        let parser: Arc<dyn ReplyParser> = if config.structured_output {
            Arc::new(StructuredReplyParser::default())
        } else {
            Arc::new(LineScanParser)
        };
        Self {
            pool,
            config,
            sleeper: Arc::new(TokioSleeper),
            parser,
        }
    }

    /// Gemini-backed engine. Never fails: a missing key surfaces as `NotConfigured` on first use.
    pub fn from_env() -> Self {
        let config = EngineConfig::from_env();
        let pool = ConnectionPool::new(config.health, crate::gemini::connect_from_env);
        Self::new(Arc::new(pool), config)
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ReplyParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Same pool, different wall-clock ceiling for both streaming and polling.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.stream_timeout = timeout;
        self.config.max_poll_time = timeout;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
