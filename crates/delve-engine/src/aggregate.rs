use crate::engine::ResearchEngine;
use delve_core::{
    Error, FailureCode, ProgressEvent, ProgressKind, ResearchRequest, ResearchResult, Result,
    UsageStats,
};
use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeepResearchOptions {
    /// Critique the report and append answers to its gaps.
    pub auto_refine: bool,
    /// Append a web-grounded fact-check section.
    pub grounded: bool,
}

/// Folds progress events into a report: text in arrival order, non-empty thoughts, last
/// interaction id seen.
#[derive(Debug, Default)]
pub struct Aggregator {
    text: String,
    thinking_summaries: Vec<String>,
    interaction_id: Option<String>,
    usage: Option<UsageStats>,
    completed: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An `error` event becomes the returned error; everything else is folded in.
    pub fn push(&mut self, ev: &ProgressEvent) -> Result<()> {
        if let Some(id) = &ev.interaction_id {
            self.interaction_id = Some(id.clone());
        }
        match ev.kind {
            ProgressKind::Text => {
                if let Some(t) = &ev.content {
                    self.text.push_str(t);
                }
            }
            ProgressKind::Thought => {
                if let Some(t) = ev.content.as_ref().filter(|t| !t.is_empty()) {
                    self.thinking_summaries.push(t.clone());
                }
            }
            ProgressKind::Complete => {
                self.completed = true;
                if ev.usage.is_some() {
                    self.usage = ev.usage.clone();
                }
            }
            ProgressKind::Error => {
                let message = ev.content.as_deref().unwrap_or("Unknown error");
                return Err(Error::research(
                    ev.failure.unwrap_or(FailureCode::ResearchFailed),
                    message,
                    self.interaction_id.clone(),
                ));
            }
            ProgressKind::Start | ProgressKind::Status => {}
        }
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn interaction_id(&self) -> Option<&str> {
        self.interaction_id.as_deref()
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn finish(self, duration_seconds: f64) -> ResearchResult {
        ResearchResult {
            text: self.text,
            thinking_summaries: self.thinking_summaries,
            interaction_id: self.interaction_id,
            usage: self.usage,
            duration_seconds,
            raw: None,
        }
    }
}

/// Disconnect before any text: the report can still be fetched by polling.
fn falls_back_to_polling(err: &Error, agg: &Aggregator) -> bool {
    err.failure_code() == Some(FailureCode::StreamDisconnected)
        && agg.interaction_id().is_some()
        && agg.text().trim().is_empty()
}

impl ResearchEngine {
    /// Run a research request to completion and return the report.
    ///
    /// Streams first; when the stream yields no report text but the interaction is known, polls
    /// for it. Refinement passes run afterwards as requested and never fail the call.
    pub async fn deep_research<F>(
        &self,
        req: ResearchRequest,
        opts: DeepResearchOptions,
        mut on_progress: F,
    ) -> Result<ResearchResult>
    where
        F: FnMut(&ProgressEvent) + Send,
    {
        if req.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must be non-empty".to_string()));
        }
        // Fail fast on missing credentials instead of burning the connect budget.
        self.pool.get()?;

        let started = Instant::now();
        let query = req.query.clone();
        let mut agg = Aggregator::new();
        let mut events = self.deep_research_stream(req);
        while let Some(ev) = events.next().await {
            on_progress(&ev);
            if let Err(e) = agg.push(&ev) {
                if falls_back_to_polling(&e, &agg) {
                    warn!(error = %e, "stream gave up before any text; polling instead");
                    break;
                }
                return Err(e);
            }
        }
        drop(events);

        let mut raw = None;
        let mut polled_usage = None;
        if agg.text().trim().is_empty() {
            let Some(id) = agg.interaction_id().map(str::to_string) else {
                return Err(Error::research(
                    FailureCode::ConnectionFailed,
                    "stream ended without an interaction id",
                    None,
                ));
            };
            info!(interaction_id = id.as_str(), "no text from stream; polling");
            let snap = self.poll_until_complete(&id, &mut on_progress).await?;
            let text = snap.final_text().unwrap_or_default();
            if text.trim().is_empty() {
                return Err(Error::research(
                    FailureCode::ResearchFailed,
                    "Research completed without report text",
                    Some(id),
                ));
            }
            agg.text = text;
            polled_usage = snap.usage.clone();
            raw = Some(snap.raw);
        }

        let mut result = agg.finish(started.elapsed().as_secs_f64());
        if polled_usage.is_some() {
            result.usage = polled_usage;
        }
        result.raw = raw;

        if opts.auto_refine {
            self.refine(&query, &mut result, &mut on_progress).await;
        }
        if opts.grounded {
            self.fact_check(&query, &mut result, &mut on_progress).await;
        }
        result.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            interaction_id = result.interaction_id.as_deref(),
            chars = result.text.len(),
            duration_s = result.duration_seconds,
            "research complete"
        );
        Ok(result)
    }
}
