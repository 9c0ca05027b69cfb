//! Tool bodies shared by the MCP server and the CLI subcommands.
//!
//! Every function returns a finished JSON envelope; domain failures are `ok=false` payloads,
//! never Rust errors.

use super::envelope::{add_envelope_fields, error_obj, error_payload, ErrorCode};
use delve_core::{ProgressEvent, ProgressKind, ResearchRequest};
use delve_engine::{config, quick, DeepResearchOptions, QuickOptions, ResearchEngine};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_TIMEOUT_SECS: u64 = 86_400;
const LAST_STATUS_KEEP: usize = 5;

#[derive(Debug, Deserialize, Default)]
#[cfg_attr(feature = "stdio", derive(schemars::JsonSchema))]
pub(crate) struct QuickArgs {
    /// The question to answer.
    pub(crate) query: Option<String>,
    /// Thinking budget: minimal|low|medium|high|max|dynamic, or a token count (default: medium).
    pub(crate) thinking_level: Option<String>,
    /// Include the model's thought summary in the result (default: false).
    pub(crate) include_thoughts: Option<bool>,
    /// Model override (default: DELVE_MODEL or gemini-2.5-flash).
    pub(crate) model: Option<String>,
    pub(crate) system_instruction: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[cfg_attr(feature = "stdio", derive(schemars::JsonSchema))]
pub(crate) struct DeepArgs {
    /// The research question.
    pub(crate) query: Option<String>,
    /// Critique the report and answer its gaps with follow-up questions (default: false).
    pub(crate) auto_refine: Option<bool>,
    /// Append a web-grounded fact-check section (default: false).
    pub(crate) grounded: Option<bool>,
    /// Output format guidance appended to the query.
    pub(crate) format_instructions: Option<String>,
    /// File Search store names the agent may read from.
    pub(crate) file_search_store_names: Option<Vec<String>>,
    /// Wall-clock ceiling for the run, in seconds (default: DELVE_TIMEOUT_SECS).
    pub(crate) timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[cfg_attr(feature = "stdio", derive(schemars::JsonSchema))]
pub(crate) struct StatusArgs {
    pub(crate) interaction_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[cfg_attr(feature = "stdio", derive(schemars::JsonSchema))]
pub(crate) struct FollowupArgs {
    /// Interaction id of a finished research run.
    pub(crate) interaction_id: Option<String>,
    pub(crate) question: Option<String>,
    /// Model override (default: DELVE_FOLLOWUP_MODEL).
    pub(crate) model: Option<String>,
}

/// Counts of what a deep run emitted, plus its most recent status lines.
#[derive(Debug, Default, Serialize)]
pub(crate) struct ProgressTally {
    pub(crate) thought: u64,
    pub(crate) text: u64,
    pub(crate) status: u64,
    pub(crate) reconnects: u64,
    pub(crate) last_status: VecDeque<String>,
}

impl ProgressTally {
    pub(crate) fn observe(&mut self, ev: &ProgressEvent) {
        match ev.kind {
            ProgressKind::Thought => self.thought += 1,
            ProgressKind::Text => self.text += 1,
            ProgressKind::Status => {
                self.status += 1;
                let msg = ev.content.clone().unwrap_or_default();
                if msg.starts_with("Reconnecting") {
                    self.reconnects += 1;
                }
                if self.last_status.len() == LAST_STATUS_KEEP {
                    self.last_status.pop_front();
                }
                self.last_status.push_back(msg);
            }
            ProgressKind::Start | ProgressKind::Complete | ProgressKind::Error => {}
        }
    }
}

/// Trimmed non-empty string argument, or an `invalid_params` payload.
fn required(v: Option<String>, name: &str) -> Result<String, serde_json::Value> {
    match v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(s) => Ok(s),
        None => Err(serde_json::json!({
            "ok": false,
            "error": error_obj(
                ErrorCode::InvalidParams,
                format!("{name} must be a non-empty string"),
                ErrorCode::InvalidParams.hint(),
            ),
        })),
    }
}

fn finish(mut payload: serde_json::Value, kind: &str, t0: Instant) -> serde_json::Value {
    add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
    payload
}

#[derive(Clone)]
pub(crate) struct Tools {
    engine: ResearchEngine,
}

impl Tools {
    pub(crate) fn new(engine: ResearchEngine) -> Self {
        Self { engine }
    }

    pub(crate) fn from_env() -> Self {
        Self::new(ResearchEngine::from_env())
    }

    /// Configuration booleans and effective limits. Never includes key material.
    pub(crate) fn meta(&self) -> serde_json::Value {
        let t0 = Instant::now();
        let cfg = self.engine.config();
        let payload = serde_json::json!({
            "ok": true,
            "name": "delve",
            "version": env!("CARGO_PKG_VERSION"),
            "configured": {
                "gemini": config::gemini_api_key_from_env().is_some(),
                "base_url_override": config::env("DELVE_GEMINI_BASE_URL").is_some(),
            },
            "agent": config::env("DELVE_AGENT").unwrap_or_else(|| config::DEFAULT_AGENT.to_string()),
            "models": {
                "quick": cfg.models.quick,
                "critique": cfg.models.critique,
                "fact_check": cfg.models.fact_check,
                "followup": cfg.models.followup,
            },
            "limits": {
                "max_initial_retries": cfg.max_initial_retries,
                "max_stream_retries": cfg.max_stream_retries,
                "initial_backoff_ms": cfg.initial_backoff.base.as_millis() as u64,
                "backoff_growth": cfg.stream_backoff.growth,
                "max_initial_retry_delay_ms": cfg.initial_backoff.max.as_millis() as u64,
                "max_stream_retry_delay_ms": cfg.stream_backoff.max.as_millis() as u64,
                "poll_interval_ms": cfg.poll_interval.as_millis() as u64,
                "max_poll_secs": cfg.max_poll_time.as_secs(),
                "timeout_secs": cfg.stream_timeout.as_secs(),
                "stream_idle_secs": cfg.stream_idle_timeout.as_secs(),
                "client_max_age_secs": cfg.health.max_age.as_secs(),
                "client_max_requests": cfg.health.max_requests,
            },
            "structured_output": cfg.structured_output,
            "connection": self.engine.pool().snapshot(),
        });
        finish(payload, "delve_meta", t0)
    }

    pub(crate) async fn quick(&self, args: QuickArgs) -> serde_json::Value {
        const KIND: &str = "research_quick";
        let t0 = Instant::now();
        let query = match required(args.query, "query") {
            Ok(q) => q,
            Err(p) => return finish(p, KIND, t0),
        };
        let opts = QuickOptions {
            model: args.model.filter(|m| !m.trim().is_empty()),
            thinking_budget: args
                .thinking_level
                .as_deref()
                .map(quick::thinking_budget)
                .unwrap_or(quick::DEFAULT_THINKING_BUDGET),
            include_thoughts: args.include_thoughts.unwrap_or(false),
            system_instruction: args.system_instruction.filter(|s| !s.trim().is_empty()),
        };
        let request = serde_json::json!({
            "query": query,
            "model": opts.model.clone().unwrap_or_else(|| self.engine.config().models.quick.clone()),
            "thinking_budget": opts.thinking_budget,
            "include_thoughts": opts.include_thoughts,
        });
        let mut payload = match self.engine.quick_research(&query, &opts).await {
            Ok(r) => {
                let mut p = serde_json::json!({ "ok": true });
                if let (Some(obj), Ok(serde_json::Value::Object(fields))) =
                    (p.as_object_mut(), serde_json::to_value(&r))
                {
                    obj.extend(fields);
                }
                p
            }
            Err(e) => error_payload(&e),
        };
        payload["request"] = request;
        finish(payload, KIND, t0)
    }

    pub(crate) async fn deep<F>(&self, args: DeepArgs, mut on_progress: F) -> serde_json::Value
    where
        F: FnMut(&ProgressEvent) + Send,
    {
        const KIND: &str = "research_deep";
        let t0 = Instant::now();
        let query = match required(args.query, "query") {
            Ok(q) => q,
            Err(p) => return finish(p, KIND, t0),
        };
        let opts = DeepResearchOptions {
            auto_refine: args.auto_refine.unwrap_or(false),
            grounded: args.grounded.unwrap_or(false),
        };
        let req = ResearchRequest {
            format_instructions: args.format_instructions.filter(|s| !s.trim().is_empty()),
            file_search_store_names: args
                .file_search_store_names
                .unwrap_or_default()
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            ..ResearchRequest::new(query.clone())
        };
        let timeout_secs = args.timeout_secs.map(|s| s.clamp(1, MAX_TIMEOUT_SECS));
        let request = serde_json::json!({
            "query": query,
            "auto_refine": opts.auto_refine,
            "grounded": opts.grounded,
            "format_instructions": req.format_instructions,
            "file_search_store_names": req.file_search_store_names,
            "timeout_secs": timeout_secs.unwrap_or_else(|| self.engine.config().stream_timeout.as_secs()),
        });

        let engine = match timeout_secs {
            Some(s) => self.engine.clone().with_timeout(Duration::from_secs(s)),
            None => self.engine.clone(),
        };
        let mut tally = ProgressTally::default();
        let outcome = engine
            .deep_research(req, opts, |ev: &ProgressEvent| {
                tally.observe(ev);
                on_progress(ev);
            })
            .await;
        let mut payload = match outcome {
            Ok(r) => serde_json::json!({
                "ok": true,
                "interaction_id": r.interaction_id,
                "text": r.text,
                "thinking_summaries": r.thinking_summaries,
                "usage": r.usage,
                "duration_seconds": r.duration_seconds,
            }),
            Err(e) => error_payload(&e),
        };
        payload["request"] = request;
        payload["progress"] = serde_json::to_value(&tally).unwrap_or(serde_json::Value::Null);
        finish(payload, KIND, t0)
    }

    pub(crate) async fn status(&self, args: StatusArgs) -> serde_json::Value {
        const KIND: &str = "research_status";
        let t0 = Instant::now();
        let id = match required(args.interaction_id, "interaction_id") {
            Ok(id) => id,
            Err(p) => return finish(p, KIND, t0),
        };
        let mut payload = match self.engine.research_status(&id).await {
            Ok(snap) => {
                let completed = snap.status == delve_core::InteractionStatus::Completed;
                serde_json::json!({
                    "ok": true,
                    "interaction_id": id,
                    "status": snap.status.as_str(),
                    "terminal": snap.status.is_terminal(),
                    "text": if completed { snap.final_text() } else { None },
                    "usage": snap.usage,
                    "backend_error": snap.error,
                })
            }
            Err(e) => error_payload(&e),
        };
        payload["request"] = serde_json::json!({ "interaction_id": id });
        finish(payload, KIND, t0)
    }

    pub(crate) async fn followup(&self, args: FollowupArgs) -> serde_json::Value {
        const KIND: &str = "research_followup";
        let t0 = Instant::now();
        let (id, question) = match (
            required(args.interaction_id, "interaction_id"),
            required(args.question, "question"),
        ) {
            (Ok(id), Ok(q)) => (id, q),
            (Err(p), _) | (_, Err(p)) => return finish(p, KIND, t0),
        };
        let model = args.model.filter(|m| !m.trim().is_empty());
        let mut payload = match self
            .engine
            .research_followup(&id, &question, model.as_deref())
            .await
        {
            Ok(text) => serde_json::json!({
                "ok": true,
                "previous_interaction_id": id,
                "text": text,
            }),
            Err(e) => error_payload(&e),
        };
        payload["request"] = serde_json::json!({
            "interaction_id": id,
            "question": question,
            "model": model,
        });
        finish(payload, KIND, t0)
    }
}
