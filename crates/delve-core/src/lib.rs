use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("{code}: {message}")]
    Research {
        code: FailureCode,
        message: String,
        interaction_id: Option<String>,
    },
}

impl Error {
    pub fn research(
        code: FailureCode,
        message: impl Into<String>,
        interaction_id: Option<String>,
    ) -> Self {
        Self::Research {
            code,
            message: message.into(),
            interaction_id,
        }
    }

    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            Self::Research { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn interaction_id(&self) -> Option<&str> {
        match self {
            Self::Research { interaction_id, .. } => interaction_id.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by backend adapters, already classified.
///
/// Adapters decide retryability exactly once (HTTP status class, transport error kind,
/// configured keywords). Everything above the adapter matches on the tag only.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(r) | Self::Fatal(r) => r,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// No interaction was ever started.
    ConnectionFailed,
    /// The stream dropped and the reconnect budget ran out.
    StreamDisconnected,
    /// The backend reported the research as failed (or cancelled).
    ResearchFailed,
    /// A wall-clock ceiling was reached while streaming or polling.
    Timeout,
    /// A follow-up call produced no text.
    NoResponse,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::StreamDisconnected => "STREAM_DISCONNECTED",
            Self::ResearchFailed => "RESEARCH_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::NoResponse => "NO_RESPONSE",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    /// Anything the backend reports that we do not recognise. Treated as "still running".
    Unknown,
}

impl InteractionStatus {
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "in_progress" | "running" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Once terminal, an interaction never reverts.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Start,
    Thought,
    Text,
    Complete,
    Error,
    Status,
}

/// One entry of the progress sequence handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Set only on terminal `error` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCode>,
    /// Usage reported on the terminal `complete` event, when the backend includes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind) -> Self {
        Self {
            kind,
            content: None,
            interaction_id: None,
            event_id: None,
            failure: None,
            usage: None,
        }
    }

    pub fn status(content: impl Into<String>, interaction_id: Option<String>) -> Self {
        Self {
            content: Some(content.into()),
            interaction_id,
            ..Self::new(ProgressKind::Status)
        }
    }

    pub fn failed(
        code: FailureCode,
        content: impl Into<String>,
        interaction_id: Option<String>,
        event_id: Option<String>,
    ) -> Self {
        Self {
            content: Some(content.into()),
            interaction_id,
            event_id,
            failure: Some(code),
            ..Self::new(ProgressKind::Error)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ProgressKind::Complete | ProgressKind::Error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

fn first_u64(obj: &serde_json::Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(|v| v.as_u64()))
}

impl UsageStats {
    /// Extract usage from an interaction payload.
    ///
    /// The backend has shipped two naming schemes (`usage_metadata` with `*_token_count`
    /// fields, and `usage` with `*_tokens` fields); either is accepted.
    pub fn from_interaction(v: &serde_json::Value) -> Option<Self> {
        let u = ["usage_metadata", "usageMetadata", "usage"]
            .iter()
            .find_map(|k| v.get(*k).filter(|x| x.is_object()))?;
        Some(Self {
            prompt_tokens: first_u64(u, &["prompt_token_count", "promptTokenCount", "prompt_tokens"]),
            completion_tokens: first_u64(
                u,
                &["candidates_token_count", "candidatesTokenCount", "completion_tokens"],
            ),
            total_tokens: first_u64(u, &["total_token_count", "totalTokenCount", "total_tokens"]),
            total_cost: u.get("total_cost").and_then(|x| x.as_f64()),
        })
    }
}

/// Final value returned by the aggregate research call.
///
/// `text` is empty only when the run failed or never completed; check the outcome before
/// treating an empty report as "no content".
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResearchResult {
    pub text: String,
    pub thinking_summaries: Vec<String>,
    pub interaction_id: Option<String>,
    pub usage: Option<UsageStats>,
    pub duration_seconds: f64,
    /// Raw terminal interaction payload (kept for citation post-processing).
    #[serde(skip)]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CritiqueRating {
    Pass,
    NeedsRefinement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CritiqueResult {
    pub rating: CritiqueRating,
    pub gaps: Vec<String>,
    /// At most five.
    pub follow_up_questions: Vec<String>,
    #[serde(skip)]
    pub raw_response: String,
}

impl CritiqueResult {
    pub fn needs_refinement(&self) -> bool {
        self.rating == CritiqueRating::NeedsRefinement
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactCheckRating {
    Verified,
    PartiallyVerified,
    Disputed,
    InsufficientData,
}

impl FactCheckRating {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "VERIFIED",
            Self::PartiallyVerified => "PARTIALLY_VERIFIED",
            Self::Disputed => "DISPUTED",
            Self::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundedCritiqueResult {
    pub fact_check_rating: FactCheckRating,
    pub claims_verified: Vec<String>,
    pub claims_disputed: Vec<String>,
    pub sources: Vec<String>,
    pub search_queries: Vec<String>,
    #[serde(skip)]
    pub raw_response: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub format_instructions: Option<String>,
    #[serde(default)]
    pub file_search_store_names: Vec<String>,
    /// Agent override; the adapter's configured agent is used when unset.
    #[serde(default)]
    pub agent: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn prompt(&self) -> String {
        match self
            .format_instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(fi) => format!("{}\n\n{}", self.query, fi),
            None => self.query.clone(),
        }
    }
}

/// One server-sent event from the research backend, before decoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<WireInteraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<WireDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl WireEvent {
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string()),
            None => "Unknown error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireInteraction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireDelta {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

impl WireDelta {
    /// Thought summaries arrive as `content: {text}` or a bare string.
    pub fn thought_text(&self) -> Option<String> {
        match &self.content {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(v) => v
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            None => self.text.clone(),
        }
    }
}

/// Point-in-time view of an interaction, as returned by a non-streaming `get`.
#[derive(Debug, Clone)]
pub struct InteractionSnapshot {
    pub id: Option<String>,
    pub status: InteractionStatus,
    pub usage: Option<UsageStats>,
    pub error: Option<String>,
    pub raw: serde_json::Value,
}

impl InteractionSnapshot {
    pub fn from_value(raw: serde_json::Value) -> Self {
        let status = raw
            .get("status")
            .and_then(|s| s.as_str())
            .map(InteractionStatus::from_wire)
            .unwrap_or(InteractionStatus::Unknown);
        let error = raw.get("error").filter(|e| !e.is_null()).map(|e| match e {
            serde_json::Value::String(s) => s.clone(),
            v => v
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string()),
        });
        Self {
            id: raw.get("id").and_then(|s| s.as_str()).map(str::to_string),
            status,
            usage: UsageStats::from_interaction(&raw),
            error,
            raw,
        }
    }

    /// Text of the last output (`text`, falling back to `content`).
    pub fn final_text(&self) -> Option<String> {
        let last = self.raw.get("outputs")?.as_array()?.last()?;
        if let Some(t) = last.get("text").and_then(|t| t.as_str()) {
            return Some(t.to_string());
        }
        match last.get("content")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            v => Some(v.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system_instruction: Option<String>,
    /// Attach the web-search tool so the reply is grounded.
    #[serde(default)]
    pub grounded: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub thinking_budget: Option<i32>,
    #[serde(default)]
    pub include_thoughts: bool,
    /// Ask for a JSON reply constrained to this schema.
    #[serde(default)]
    pub response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundedResponse {
    pub text: String,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub web_search_queries: Vec<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

pub type EventStream = BoxStream<'static, BackendResult<WireEvent>>;

/// The long-running research agent.
#[async_trait::async_trait]
pub trait ResearchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a background interaction and stream its events. `Ok(None)` is an empty stream.
    async fn create_stream(&self, req: &ResearchRequest) -> BackendResult<Option<EventStream>>;

    /// Re-attach to an interaction, skipping everything up to `last_event_id`.
    async fn resume_stream(
        &self,
        interaction_id: &str,
        last_event_id: Option<&str>,
    ) -> BackendResult<Option<EventStream>>;

    async fn get_interaction(&self, interaction_id: &str) -> BackendResult<InteractionSnapshot>;

    /// Continue a completed interaction with one more question.
    async fn followup(
        &self,
        previous_interaction_id: &str,
        input: &str,
        model: &str,
    ) -> BackendResult<InteractionSnapshot>;
}

/// Synchronous text generation, optionally grounded on web search.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> BackendResult<GroundedResponse>;
}

/// One logical connection: everything the engine calls on the remote side.
pub trait Backend: ResearchBackend + ModelBackend {}

impl<T: ResearchBackend + ModelBackend + ?Sized> Backend for T {}
