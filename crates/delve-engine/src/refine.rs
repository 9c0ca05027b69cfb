use crate::engine::ResearchEngine;
use delve_core::{
    CritiqueRating, CritiqueResult, FactCheckRating, GenerateRequest, GroundedCritiqueResult,
    ProgressEvent, ResearchResult, Result,
};
use serde::Deserialize;
use tracing::{info, warn};

const MAX_FOLLOW_UPS: usize = 5;

const CRITIQUE_PROMPT: &str = r#"You are a research quality critic. Evaluate the following research report
for completeness and quality.

**Original Query:** {query}

**Research Report:**
{report}

**Your Task:**
1. Identify any significant gaps, missing information, or areas that need elaboration
2. Rate the report quality: PASS (comprehensive) or NEEDS_REFINEMENT (has gaps)
3. If NEEDS_REFINEMENT, provide 2-4 specific follow-up questions to fill the gaps

**Output Format:**
```
RATING: [PASS or NEEDS_REFINEMENT]

GAPS IDENTIFIED:
- [Gap 1]
- [Gap 2]

FOLLOW_UP_QUESTIONS:
1. [Specific question to address gap 1]
2. [Specific question to address gap 2]
```

Be constructive and specific. Focus on substantive gaps, not stylistic preferences.
"#;

const FACT_CHECK_PROMPT: &str = r#"You are a rigorous fact-checker with access to Google Search. Always verify dates, names, and specific claims before responding.

ORIGINAL QUERY: {query}

REPORT TO FACT-CHECK:
{report}

INSTRUCTIONS:
1. Identify 3-5 key factual claims in the report (focus on dates, statistics, names)
2. Use Google Search to verify each claim against current authoritative sources
3. Categorize each claim as VERIFIED (found matching sources) or DISPUTED (conflicts or no sources)
4. Rate overall accuracy based on verification results

OUTPUT FORMAT:
CLAIMS_VERIFIED:
- [factual claim that was confirmed by web search]

CLAIMS_DISPUTED:
- [claim that couldn't be verified or conflicts with current sources]

RATING: VERIFIED | PARTIALLY_VERIFIED | DISPUTED | INSUFFICIENT_DATA
"#;

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn render(template: &str, query: &str, report: &str) -> String {
    template.replace("{query}", query).replace("{report}", report)
}

/// Turns a refinement model's reply into structured results.
pub trait ReplyParser: Send + Sync {
    fn parse_critique(&self, reply: &str) -> CritiqueResult;

    /// Sources and search queries come from grounding metadata, not the reply; callers fill
    /// them in.
    fn parse_fact_check(&self, reply: &str) -> GroundedCritiqueResult;

    /// JSON schema to request from the model, if this parser wants structured replies.
    fn critique_schema(&self) -> Option<serde_json::Value> {
        None
    }

    fn fact_check_schema(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Scans the plain-text reply formats the prompts ask for.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineScanParser;

fn numbered_item(line: &str) -> Option<&str> {
    let (n, rest) = line.split_once('.')?;
    matches!(n, "1" | "2" | "3" | "4" | "5").then(|| rest.trim())
}

impl ReplyParser for LineScanParser {
    fn parse_critique(&self, reply: &str) -> CritiqueResult {
        let upper = reply.to_uppercase();
        let rating = if upper.contains("RATING: PASS") {
            CritiqueRating::Pass
        } else {
            CritiqueRating::NeedsRefinement
        };

        let mut follow_up_questions = Vec::new();
        let mut in_questions = false;
        for line in reply.lines().map(str::trim) {
            let up = line.to_uppercase();
            if up.contains("FOLLOW_UP_QUESTIONS:") || up.contains("FOLLOW-UP QUESTIONS:") {
                in_questions = true;
                continue;
            }
            if !in_questions {
                continue;
            }
            if let Some(q) = numbered_item(line).filter(|q| !q.is_empty()) {
                follow_up_questions.push(q.to_string());
            }
        }
        follow_up_questions.truncate(MAX_FOLLOW_UPS);

        let mut gaps = Vec::new();
        let mut in_gaps = false;
        for line in reply.lines().map(str::trim) {
            if line.to_uppercase().contains("GAPS IDENTIFIED:") {
                in_gaps = true;
                continue;
            }
            if in_gaps && (line.starts_with("FOLLOW") || line.is_empty()) {
                in_gaps = false;
                continue;
            }
            if in_gaps {
                if let Some(gap) = line.strip_prefix('-').map(str::trim).filter(|g| !g.is_empty()) {
                    gaps.push(gap.to_string());
                }
            }
        }

        CritiqueResult {
            rating,
            gaps,
            follow_up_questions,
            raw_response: reply.to_string(),
        }
    }

    fn parse_fact_check(&self, reply: &str) -> GroundedCritiqueResult {
        let upper = reply.to_uppercase();
        let fact_check_rating = [
            FactCheckRating::Verified,
            FactCheckRating::PartiallyVerified,
            FactCheckRating::Disputed,
        ]
        .into_iter()
        .find(|r| upper.contains(&format!("RATING: {}", r.as_str())))
        .unwrap_or(FactCheckRating::InsufficientData);

        #[derive(PartialEq)]
        enum Section {
            None,
            Verified,
            Disputed,
        }
        let mut section = Section::None;
        let mut claims_verified = Vec::new();
        let mut claims_disputed = Vec::new();
        for line in reply.lines().map(str::trim) {
            let up = line.to_uppercase();
            if up.contains("CLAIMS_VERIFIED:") || up.contains("CLAIMS VERIFIED:") {
                section = Section::Verified;
                continue;
            }
            if up.contains("CLAIMS_DISPUTED:") || up.contains("CLAIMS DISPUTED:") {
                section = Section::Disputed;
                continue;
            }
            if up.contains("RATING:") {
                section = Section::None;
                continue;
            }
            let Some(claim) = line.strip_prefix('-').map(str::trim).filter(|c| !c.is_empty()) else {
                continue;
            };
            match section {
                Section::Verified => claims_verified.push(claim.to_string()),
                Section::Disputed => claims_disputed.push(claim.to_string()),
                Section::None => {}
            }
        }

        GroundedCritiqueResult {
            fact_check_rating,
            claims_verified,
            claims_disputed,
            sources: Vec::new(),
            search_queries: Vec::new(),
            raw_response: reply.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CritiqueReply {
    rating: CritiqueRating,
    #[serde(default)]
    gaps: Vec<String>,
    #[serde(default)]
    follow_up_questions: Vec<String>,
}

#[derive(Deserialize)]
struct FactCheckReply {
    rating: FactCheckRating,
    #[serde(default)]
    claims_verified: Vec<String>,
    #[serde(default)]
    claims_disputed: Vec<String>,
}

/// Strip a Markdown code fence, if the model wrapped its JSON in one.
fn unfence(reply: &str) -> &str {
    let t = reply.trim();
    let Some(inner) = t.strip_prefix("```") else {
        return t;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Requests JSON replies and parses them, falling back to line scanning when the reply is not
/// the expected JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredReplyParser {
    fallback: LineScanParser,
}

impl ReplyParser for StructuredReplyParser {
    fn parse_critique(&self, reply: &str) -> CritiqueResult {
        match serde_json::from_str::<CritiqueReply>(unfence(reply)) {
            Ok(c) => {
                let mut follow_up_questions: Vec<String> = c
                    .follow_up_questions
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
                follow_up_questions.truncate(MAX_FOLLOW_UPS);
                CritiqueResult {
                    rating: c.rating,
                    gaps: c.gaps,
                    follow_up_questions,
                    raw_response: reply.to_string(),
                }
            }
            Err(_) => self.fallback.parse_critique(reply),
        }
    }

    fn parse_fact_check(&self, reply: &str) -> GroundedCritiqueResult {
        match serde_json::from_str::<FactCheckReply>(unfence(reply)) {
            Ok(f) => GroundedCritiqueResult {
                fact_check_rating: f.rating,
                claims_verified: f.claims_verified,
                claims_disputed: f.claims_disputed,
                sources: Vec::new(),
                search_queries: Vec::new(),
                raw_response: reply.to_string(),
            },
            Err(_) => self.fallback.parse_fact_check(reply),
        }
    }

    fn critique_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "OBJECT",
            "properties": {
                "rating": {"type": "STRING", "enum": ["PASS", "NEEDS_REFINEMENT"]},
                "gaps": {"type": "ARRAY", "items": {"type": "STRING"}},
                "follow_up_questions": {"type": "ARRAY", "items": {"type": "STRING"}, "maxItems": MAX_FOLLOW_UPS}
            },
            "required": ["rating", "gaps", "follow_up_questions"]
        }))
    }

    fn fact_check_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "OBJECT",
            "properties": {
                "claims_verified": {"type": "ARRAY", "items": {"type": "STRING"}},
                "claims_disputed": {"type": "ARRAY", "items": {"type": "STRING"}},
                "rating": {"type": "STRING", "enum": ["VERIFIED", "PARTIALLY_VERIFIED", "DISPUTED", "INSUFFICIENT_DATA"]}
            },
            "required": ["claims_verified", "claims_disputed", "rating"]
        }))
    }
}

fn fact_check_section(fc: &GroundedCritiqueResult, max_sources: usize) -> String {
    let mut out = format!(
        "\n\n---\n\n## Fact-Check (Grounded)\n\n**Rating:** {}\n\n",
        fc.fact_check_rating.as_str()
    );
    let mut list = |title: &str, items: &[String]| {
        if items.is_empty() {
            return;
        }
        out.push_str(&format!("### {title}\n"));
        for item in items {
            out.push_str(&format!("- {item}\n"));
        }
        out.push('\n');
    };
    list("Verified Claims", &fc.claims_verified);
    list("Disputed Claims", &fc.claims_disputed);
    let shown = &fc.sources[..fc.sources.len().min(max_sources)];
    list("Verification Sources", shown);
    out
}

impl ResearchEngine {
    /// Rate a report; NEEDS_REFINEMENT comes with the questions that would close its gaps.
    pub async fn critique(&self, query: &str, report: &str) -> Result<CritiqueResult> {
        let report = truncate_chars(report, self.config.critique_max_chars);
        let req = GenerateRequest {
            model: self.config.models.critique.clone(),
            prompt: render(CRITIQUE_PROMPT, query, report),
            response_schema: self.parser.critique_schema(),
            ..GenerateRequest::default()
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
        let critique = self.parser.parse_critique(&reply.text);
        info!(
            rating = ?critique.rating,
            gaps = critique.gaps.len(),
            questions = critique.follow_up_questions.len(),
            "critique"
        );
        Ok(critique)
    }

    /// Verify the report's key claims against live web search.
    pub async fn grounded_critique(&self, query: &str, report: &str) -> Result<GroundedCritiqueResult> {
        let report = truncate_chars(report, self.config.fact_check_max_chars);
        let req = GenerateRequest {
            model: self.config.models.fact_check.clone(),
            prompt: render(FACT_CHECK_PROMPT, query, report),
            grounded: true,
            temperature: Some(1.0),
            response_schema: self.parser.fact_check_schema(),
            ..GenerateRequest::default()
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
        let mut fc = self.parser.parse_fact_check(&reply.text);
        fc.sources = reply.sources.into_iter().map(|s| s.uri).collect();
        fc.search_queries = reply.web_search_queries;
        info!(
            rating = fc.fact_check_rating.as_str(),
            verified = fc.claims_verified.len(),
            disputed = fc.claims_disputed.len(),
            sources = fc.sources.len(),
            "grounded fact-check"
        );
        Ok(fc)
    }

    /// Critique the report and append answers to up to `max_followups` gap questions.
    ///
    /// Never fails: a failed critique leaves the report as is and adds a note; a failed
    /// follow-up is skipped.
    pub async fn refine<F>(&self, query: &str, result: &mut ResearchResult, on_progress: &mut F)
    where
        F: FnMut(&ProgressEvent) + Send,
    {
        let Some(interaction_id) = result.interaction_id.clone() else {
            warn!("no interaction id; skipping refinement");
            return;
        };
        on_progress(&ProgressEvent::status(
            "Running quality critique...",
            Some(interaction_id.clone()),
        ));
        let critique = match self.critique(query, &result.text).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "critique failed");
                result
                    .thinking_summaries
                    .push(format!("Auto-refinement skipped: critique failed: {e}"));
                return;
            }
        };
        if !critique.needs_refinement() || critique.follow_up_questions.is_empty() {
            info!("report passed critique");
            return;
        }

        let questions = &critique.follow_up_questions[..critique
            .follow_up_questions
            .len()
            .min(self.config.max_followups)];
        on_progress(&ProgressEvent::status(
            format!("Refining: {} follow-up queries", questions.len()),
            Some(interaction_id.clone()),
        ));
        let mut refinements = Vec::new();
        for (i, question) in questions.iter().enumerate() {
            match self.research_followup(&interaction_id, question, None).await {
                Ok(answer) => refinements.push(format!("### {question}\n\n{answer}")),
                Err(e) => warn!(n = i + 1, error = %e, "follow-up failed"),
            }
        }
        if refinements.is_empty() {
            return;
        }
        result.text.push_str("\n\n---\n\n## Refinements\n\n");
        result.text.push_str(&refinements.join("\n\n"));
        result.thinking_summaries.push(format!(
            "Auto-refinement: Addressed {} gaps identified by critique",
            refinements.len()
        ));
        info!(appended = refinements.len(), "refinements appended");
    }

    /// Append a grounded fact-check section. A failure only adds a note.
    pub async fn fact_check<F>(&self, query: &str, result: &mut ResearchResult, on_progress: &mut F)
    where
        F: FnMut(&ProgressEvent) + Send,
    {
        if result.text.is_empty() {
            return;
        }
        on_progress(&ProgressEvent::status(
            "Running grounded fact-check...",
            result.interaction_id.clone(),
        ));
        match self.grounded_critique(query, &result.text).await {
            Ok(fc) => {
                result
                    .text
                    .push_str(&fact_check_section(&fc, self.config.max_fact_check_sources));
                result.thinking_summaries.push(format!(
                    "Grounded fact-check: {} ({} verified, {} disputed)",
                    fc.fact_check_rating.as_str(),
                    fc.claims_verified.len(),
                    fc.claims_disputed.len()
                ));
            }
            Err(e) => {
                warn!(error = %e, "grounded fact-check failed");
                result
                    .thinking_summaries
                    .push(format!("Grounded fact-check failed: {e}"));
            }
        }
    }
}
