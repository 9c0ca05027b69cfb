use crate::engine::ResearchEngine;
use delve_core::{
    Error, FailureCode, GenerateRequest, InteractionSnapshot, InteractionStatus, Result, Source,
};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::info;

pub const THINKING_BUDGETS: [(&str, i32); 6] = [
    ("minimal", 0),
    ("low", 2048),
    ("medium", 8192),
    ("high", 16384),
    ("max", 24576),
    ("dynamic", -1),
];

pub const DEFAULT_THINKING_BUDGET: i32 = 8192;

/// Token budget for a level name, or a literal integer budget.
pub fn thinking_budget(level: &str) -> i32 {
    let level = level.trim();
    if let Ok(n) = level.parse::<i32>() {
        return n.max(-1);
    }
    THINKING_BUDGETS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(level))
        .map(|(_, b)| *b)
        .unwrap_or(DEFAULT_THINKING_BUDGET)
}

fn long_date(d: NaiveDate) -> String {
    d.format("%B %d, %Y").to_string()
}

pub fn default_system_prompt() -> String {
    format!(
        "You are an expert research analyst. Today is {}.

When answering questions:
1. Provide accurate, well-researched information grounded in your search results
2. Cite your sources by referring to the specific information from each source
3. If information is uncertain or sources conflict, acknowledge this
4. Structure complex answers with clear headings and bullet points
5. Prioritize recent and authoritative sources

Your goal is to provide comprehensive, factual answers that would satisfy
a professional researcher.",
        long_date(Local::now().date_naive())
    )
}

#[derive(Debug, Clone)]
pub struct QuickOptions {
    /// Model override; `DELVE_MODEL` / the built-in default otherwise.
    pub model: Option<String>,
    pub thinking_budget: i32,
    pub include_thoughts: bool,
    pub system_instruction: Option<String>,
}

impl Default for QuickOptions {
    fn default() -> Self {
        Self {
            model: None,
            thinking_budget: DEFAULT_THINKING_BUDGET,
            include_thoughts: false,
            system_instruction: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuickResult {
    pub text: String,
    pub sources: Vec<Source>,
    pub queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_summary: Option<String>,
}

impl ResearchEngine {
    /// One grounded `generate` call: seconds, not minutes.
    pub async fn quick_research(&self, query: &str, opts: &QuickOptions) -> Result<QuickResult> {
        if query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must be non-empty".to_string()));
        }
        let req = GenerateRequest {
            model: opts
                .model
                .clone()
                .unwrap_or_else(|| self.config.models.quick.clone()),
            prompt: query.to_string(),
            system_instruction: Some(
                opts.system_instruction
                    .clone()
                    .unwrap_or_else(default_system_prompt),
            ),
            grounded: true,
            temperature: None,
            thinking_budget: Some(opts.thinking_budget),
            include_thoughts: opts.include_thoughts,
            response_schema: None,
        };
        let lease = self.pool.get()?;
        let reply = match lease.backend().generate(&req).await {
            Ok(r) => {
                self.pool.record_success(&lease);
                r
            }
            Err(e) => {
                self.pool.record_failure(&lease);
                return Err(e.into());
            }
        };
        info!(
            model = req.model.as_str(),
            sources = reply.sources.len(),
            queries = reply.web_search_queries.len(),
            "quick research"
        );
        Ok(QuickResult {
            text: reply.text,
            sources: reply.sources,
            queries: reply.web_search_queries,
            thinking_summary: reply.thought.filter(|_| opts.include_thoughts),
        })
    }

    /// Current state of an interaction; one status call, no waiting.
    pub async fn research_status(&self, interaction_id: &str) -> Result<InteractionSnapshot> {
        if interaction_id.trim().is_empty() {
            return Err(Error::InvalidRequest("interaction_id must be non-empty".to_string()));
        }
        let lease = self.pool.get()?;
        match lease.backend().get_interaction(interaction_id).await {
            Ok(snap) => {
                self.pool.record_success(&lease);
                Ok(snap)
            }
            Err(e) => {
                self.pool.record_failure(&lease);
                Err(e.into())
            }
        }
    }

    /// Ask one more question in the context of a finished interaction.
    pub async fn research_followup(
        &self,
        previous_interaction_id: &str,
        question: &str,
        model: Option<&str>,
    ) -> Result<String> {
        if previous_interaction_id.trim().is_empty() || question.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "previous_interaction_id and question must be non-empty".to_string(),
            ));
        }
        let model = model.unwrap_or(&self.config.models.followup);
        let lease = self.pool.get()?;
        let snap = match lease
            .backend()
            .followup(previous_interaction_id, question, model)
            .await
        {
            Ok(s) => {
                self.pool.record_success(&lease);
                s
            }
            Err(e) => {
                self.pool.record_failure(&lease);
                return Err(e.into());
            }
        };
        if snap.status == InteractionStatus::Failed {
            return Err(Error::research(
                FailureCode::ResearchFailed,
                snap.error.unwrap_or_else(|| "follow-up failed".to_string()),
                Some(previous_interaction_id.to_string()),
            ));
        }
        match snap.final_text().filter(|t| !t.trim().is_empty()) {
            Some(text) => Ok(text),
            None => Err(Error::research(
                FailureCode::NoResponse,
                "No response from follow-up",
                Some(previous_interaction_id.to_string()),
            )),
        }
    }
}
