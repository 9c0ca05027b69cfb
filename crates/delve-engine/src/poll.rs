use crate::engine::ResearchEngine;
use delve_core::{Error, FailureCode, InteractionSnapshot, InteractionStatus, ProgressEvent, Result};
use tokio::time::Instant;
use tracing::{debug, warn};

impl ResearchEngine {
    /// Poll an interaction until it reaches a terminal status or `max_poll_time` runs out.
    ///
    /// Emits one `status` event per successful poll. Retryable poll errors are logged and the
    /// loop continues; fatal ones end it.
    pub async fn poll_until_complete<F>(
        &self,
        interaction_id: &str,
        on_progress: &mut F,
    ) -> Result<InteractionSnapshot>
    where
        F: FnMut(&ProgressEvent) + Send,
    {
        let started = Instant::now();
        let mut polls = 0u32;
        while started.elapsed() < self.config.max_poll_time {
            let lease = self.pool.get()?;
            match lease.backend().get_interaction(interaction_id).await {
                Ok(snap) => {
                    self.pool.record_success(&lease);
                    polls += 1;
                    let elapsed = started.elapsed().as_secs_f64();
                    debug!(interaction_id, status = %snap.status, polls, "polled");
                    on_progress(&ProgressEvent::status(
                        format!("Waiting... ({}, {elapsed:.0}s)", snap.status),
                        Some(interaction_id.to_string()),
                    ));
                    match snap.status {
                        InteractionStatus::Completed => return Ok(snap),
                        InteractionStatus::Failed => {
                            let reason = snap.error.as_deref().unwrap_or("Unknown error");
                            return Err(Error::research(
                                FailureCode::ResearchFailed,
                                format!("Research failed: {reason}"),
                                Some(interaction_id.to_string()),
                            ));
                        }
                        InteractionStatus::Cancelled => {
                            return Err(Error::research(
                                FailureCode::ResearchFailed,
                                "Research was cancelled",
                                Some(interaction_id.to_string()),
                            ));
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_retryable() => {
                    self.pool.record_failure(&lease);
                    warn!(interaction_id, error = %e, "poll failed, will retry");
                }
                Err(e) => {
                    self.pool.record_failure(&lease);
                    return Err(e.into());
                }
            }
            self.sleeper.sleep(self.config.poll_interval).await;
        }
        Err(Error::research(
            FailureCode::Timeout,
            format!(
                "Research still running after {}s of polling",
                self.config.max_poll_time.as_secs()
            ),
            Some(interaction_id.to_string()),
        ))
    }
}
