//! Scripted backend, recording sleeper and env guard shared by the unit tests.

use crate::retry::Sleeper;
use delve_core::{
    BackendError, BackendResult, EventStream, GenerateRequest, GroundedResponse,
    InteractionSnapshot, ModelBackend, ResearchBackend, ResearchRequest, WireEvent,
};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialises env mutation across tests and restores previous values on drop.
pub(crate) struct EnvGuard {
    _lock: MutexGuard<'static, ()>,
    prev: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    pub(crate) fn new(vars: &[(&'static str, Option<&str>)]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut prev = Vec::new();
        for (k, v) in vars {
            prev.push((*k, std::env::var(k).ok()));
            match v {
                Some(v) => std::env::set_var(k, v),
                None => std::env::remove_var(k),
            }
        }
        Self { _lock: lock, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (k, v) in self.prev.drain(..) {
            match v {
                Some(v) => std::env::set_var(k, v),
                None => std::env::remove_var(k),
            }
        }
    }
}

/// Wire event builders.
pub(crate) mod wire {
    use delve_core::{WireDelta, WireEvent, WireInteraction};

    pub(crate) fn start(interaction_id: &str, event_id: &str) -> WireEvent {
        WireEvent {
            event_type: "interaction.start".into(),
            event_id: Some(event_id.into()),
            interaction: Some(WireInteraction {
                id: Some(interaction_id.into()),
                status: Some("in_progress".into()),
                usage: None,
            }),
            ..WireEvent::default()
        }
    }

    pub(crate) fn thought(text: &str, event_id: &str) -> WireEvent {
        WireEvent {
            event_type: "content.delta".into(),
            event_id: Some(event_id.into()),
            delta: Some(WireDelta {
                kind: "thought_summary".into(),
                text: None,
                content: Some(serde_json::json!({ "text": text })),
            }),
            ..WireEvent::default()
        }
    }

    pub(crate) fn text(text: &str, event_id: &str) -> WireEvent {
        WireEvent {
            event_type: "content.delta".into(),
            event_id: Some(event_id.into()),
            delta: Some(WireDelta {
                kind: "text".into(),
                text: Some(text.into()),
                content: None,
            }),
            ..WireEvent::default()
        }
    }

    pub(crate) fn complete(event_id: &str) -> WireEvent {
        WireEvent {
            event_type: "interaction.complete".into(),
            event_id: Some(event_id.into()),
            interaction: Some(WireInteraction {
                id: None,
                status: Some("completed".into()),
                usage: None,
            }),
            ..WireEvent::default()
        }
    }

    pub(crate) fn error(message: &str) -> WireEvent {
        WireEvent {
            event_type: "error".into(),
            error: Some(serde_json::json!({ "message": message })),
            ..WireEvent::default()
        }
    }
}

/// What one `create_stream` / `resume_stream` call yields.
pub(crate) enum Open {
    Empty,
    Fail(BackendError),
    Events(Vec<BackendResult<WireEvent>>),
    /// Delivers the events, then goes silent without closing.
    Stalled(Vec<WireEvent>),
}

impl Open {
    pub(crate) fn events(evs: Vec<WireEvent>) -> Self {
        Self::Events(evs.into_iter().map(Ok).collect())
    }

    /// Delivers `evs`, then the connection drops.
    pub(crate) fn dropped_after(evs: Vec<WireEvent>) -> Self {
        let mut items: Vec<BackendResult<WireEvent>> = evs.into_iter().map(Ok).collect();
        items.push(Err(BackendError::Retryable("connection reset".into())));
        Self::Events(items)
    }

    fn into_stream(self) -> BackendResult<Option<EventStream>> {
        match self {
            Self::Empty => Ok(None),
            Self::Fail(e) => Err(e),
            Self::Events(items) => Ok(Some(futures_util::stream::iter(items).boxed())),
            Self::Stalled(evs) => Ok(Some(
                futures_util::stream::iter(evs.into_iter().map(Ok))
                    .chain(futures_util::stream::pending())
                    .boxed(),
            )),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Calls {
    pub(crate) creates: usize,
    pub(crate) resumes: Vec<(String, Option<String>)>,
    pub(crate) polls: usize,
    pub(crate) followups: Vec<(String, String, String)>,
    pub(crate) generates: Vec<GenerateRequest>,
}

/// Backend whose every call pops the next scripted reply.
///
/// Exhausted scripts answer with an empty stream (create/resume) or a fatal error.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    creates: Mutex<VecDeque<Open>>,
    resumes: Mutex<VecDeque<Open>>,
    polls: Mutex<VecDeque<BackendResult<InteractionSnapshot>>>,
    followups: Mutex<VecDeque<BackendResult<InteractionSnapshot>>>,
    generates: Mutex<VecDeque<BackendResult<GroundedResponse>>>,
    calls: Mutex<Calls>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedBackend {
    pub(crate) fn on_create(self, o: Open) -> Self {
        lock(&self.creates).push_back(o);
        self
    }

    pub(crate) fn on_resume(self, o: Open) -> Self {
        lock(&self.resumes).push_back(o);
        self
    }

    pub(crate) fn on_poll(self, status: &str, outputs: serde_json::Value) -> Self {
        let snap = InteractionSnapshot::from_value(serde_json::json!({
            "id": "int-1",
            "status": status,
            "outputs": outputs,
        }));
        lock(&self.polls).push_back(Ok(snap));
        self
    }

    pub(crate) fn on_poll_result(self, r: BackendResult<InteractionSnapshot>) -> Self {
        lock(&self.polls).push_back(r);
        self
    }

    pub(crate) fn on_followup(self, text: &str) -> Self {
        let snap = InteractionSnapshot::from_value(serde_json::json!({
            "id": "fu",
            "status": "completed",
            "outputs": [{"type": "text", "text": text}],
        }));
        lock(&self.followups).push_back(Ok(snap));
        self
    }

    pub(crate) fn on_generate(self, r: BackendResult<GroundedResponse>) -> Self {
        lock(&self.generates).push_back(r);
        self
    }

    pub(crate) fn on_generate_text(self, text: &str) -> Self {
        self.on_generate(Ok(GroundedResponse {
            text: text.to_string(),
            ..GroundedResponse::default()
        }))
    }

    pub(crate) fn calls(&self) -> Calls {
        lock(&self.calls).clone()
    }
}

#[async_trait::async_trait]
impl ResearchBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_stream(&self, _req: &ResearchRequest) -> BackendResult<Option<EventStream>> {
        lock(&self.calls).creates += 1;
        let next = lock(&self.creates).pop_front().unwrap_or(Open::Empty);
        next.into_stream()
    }

    async fn resume_stream(
        &self,
        interaction_id: &str,
        last_event_id: Option<&str>,
    ) -> BackendResult<Option<EventStream>> {
        lock(&self.calls)
            .resumes
            .push((interaction_id.to_string(), last_event_id.map(str::to_string)));
        let next = lock(&self.resumes).pop_front().unwrap_or(Open::Empty);
        next.into_stream()
    }

    async fn get_interaction(&self, _id: &str) -> BackendResult<InteractionSnapshot> {
        lock(&self.calls).polls += 1;
        lock(&self.polls)
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Fatal("no scripted poll".into())))
    }

    async fn followup(
        &self,
        previous_interaction_id: &str,
        input: &str,
        model: &str,
    ) -> BackendResult<InteractionSnapshot> {
        lock(&self.calls).followups.push((
            previous_interaction_id.to_string(),
            input.to_string(),
            model.to_string(),
        ));
        lock(&self.followups)
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Fatal("no scripted followup".into())))
    }
}

#[async_trait::async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(&self, req: &GenerateRequest) -> BackendResult<GroundedResponse> {
        lock(&self.calls).generates.push(req.clone());
        lock(&self.generates)
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Fatal("no scripted generate".into())))
    }
}

/// Records requested waits, then sleeps on the (paused) tokio clock.
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn slept(&self) -> Vec<Duration> {
        lock(&self.slept).clone()
    }
}

#[async_trait::async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, d: Duration) {
        lock(&self.slept).push(d);
        tokio::time::sleep(d).await;
    }
}
