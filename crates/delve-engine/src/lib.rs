//! Resumable deep-research engine over the Gemini Interactions API.
//!
//! - `pool` / `health`: one rotating connection shared by all runs
//! - `stream`: connect, reconnect from the last event id, emit progress
//! - `poll`: status polling when the stream can't deliver the report
//! - `aggregate`: fold progress into a [`delve_core::ResearchResult`]
//! - `refine`: critique + follow-ups, grounded fact-check
//! - `quick`: single grounded call, status lookup, follow-up questions

pub mod aggregate;
pub mod config;
pub mod decode;
pub mod engine;
pub mod gemini;
pub mod health;
pub mod poll;
pub mod pool;
pub mod quick;
pub mod refine;
pub mod retry;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::{Aggregator, DeepResearchOptions};
pub use config::{EngineConfig, GeminiConfig, ModelConfig};
pub use engine::ResearchEngine;
pub use gemini::GeminiClient;
pub use health::{ConnectionHealth, HealthLimits, RefreshReason};
pub use pool::{ConnectionPool, Lease, PoolSnapshot};
pub use quick::{QuickOptions, QuickResult};
pub use refine::{LineScanParser, ReplyParser, StructuredReplyParser};
pub use retry::{Backoff, RetryClassifier, Sleeper, TokioSleeper};
