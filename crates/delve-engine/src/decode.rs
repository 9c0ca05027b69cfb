use delve_core::{
    FailureCode, InteractionStatus, ProgressEvent, ProgressKind, UsageStats, WireEvent,
};
use tracing::{debug, warn};

/// Maps raw wire events to progress events and remembers where the stream is.
///
/// `last_event_id` advances on every wire event that carries an id, emitted or not, so a
/// resume never replays something already consumed.
#[derive(Debug, Default, Clone)]
pub struct EventDecoder {
    interaction_id: Option<String>,
    last_event_id: Option<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interaction_id(&self) -> Option<&str> {
        self.interaction_id.as_deref()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn event(&self, kind: ProgressKind, content: Option<String>) -> ProgressEvent {
        ProgressEvent {
            content,
            interaction_id: self.interaction_id.clone(),
            event_id: self.last_event_id.clone(),
            ..ProgressEvent::new(kind)
        }
    }

    pub fn decode(&mut self, ev: &WireEvent) -> Option<ProgressEvent> {
        if let Some(id) = ev.event_id.as_deref().filter(|s| !s.is_empty()) {
            self.last_event_id = Some(id.to_string());
        }
        match ev.event_type.as_str() {
            "interaction.start" => {
                let id = ev
                    .interaction
                    .as_ref()
                    .and_then(|i| i.id.as_deref())
                    .filter(|s| !s.is_empty());
                let Some(id) = id else {
                    warn!("interaction.start without an interaction id");
                    return None;
                };
                self.interaction_id = Some(id.to_string());
                Some(self.event(ProgressKind::Start, None))
            }
            "content.delta" => {
                let delta = ev.delta.as_ref()?;
                match delta.kind.as_str() {
                    "thought_summary" => {
                        let text = delta.thought_text().filter(|t| !t.is_empty())?;
                        Some(self.event(ProgressKind::Thought, Some(text)))
                    }
                    "text" => {
                        let text = delta.text.clone()?;
                        Some(self.event(ProgressKind::Text, Some(text)))
                    }
                    other => {
                        debug!(kind = other, "ignoring delta");
                        None
                    }
                }
            }
            "interaction.complete" => {
                let interaction = ev.interaction.as_ref();
                let status = interaction
                    .and_then(|i| i.status.as_deref())
                    .map_or(InteractionStatus::Unknown, InteractionStatus::from_wire);
                if status != InteractionStatus::Completed {
                    // Polling settles how the run really ended.
                    warn!(status = %status, "interaction.complete without completed status; ignoring");
                    return None;
                }
                let usage = interaction
                    .and_then(|i| i.usage.as_ref())
                    .and_then(|u| UsageStats::from_interaction(&serde_json::json!({ "usage": u })));
                Some(ProgressEvent {
                    usage,
                    ..self.event(ProgressKind::Complete, None)
                })
            }
            "error" => Some(ProgressEvent {
                failure: Some(FailureCode::ResearchFailed),
                ..self.event(ProgressKind::Error, Some(ev.error_message()))
            }),
            other => {
                debug!(event_type = other, "ignoring event");
                None
            }
        }
    }
}
