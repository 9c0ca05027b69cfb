use crate::decode::EventDecoder;
use crate::engine::ResearchEngine;
use crate::pool::Lease;
use delve_core::{
    BackendError, BackendResult, EventStream, FailureCode, ProgressEvent, ProgressKind,
    ResearchRequest, WireEvent,
};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// How a single open stream ended.
enum Drained {
    Terminal,
    Exhausted,
    Broken(BackendError),
    TimedOut,
    Cancelled,
}

enum Next {
    Item(Option<BackendResult<WireEvent>>),
    TimedOut,
    Idle,
    Closed,
}

enum Attempt {
    Retry,
    Started,
    GiveUp(String),
    /// Terminal event already sent, or the consumer is gone.
    Stop,
}

struct Run {
    tx: mpsc::Sender<ProgressEvent>,
    decoder: EventDecoder,
    started: Instant,
    deadline: Instant,
    start_sent: bool,
    disconnects: u32,
}

impl Run {
    fn elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn interaction_id(&self) -> Option<String> {
        self.decoder.interaction_id().map(str::to_string)
    }

    /// False once the consumer has dropped the receiver.
    async fn emit(&self, ev: ProgressEvent) -> bool {
        self.tx.send(ev).await.is_ok()
    }

    async fn fail(&self, code: FailureCode, message: String) {
        let ev = ProgressEvent::failed(
            code,
            message,
            self.interaction_id(),
            self.decoder.last_event_id().map(str::to_string),
        );
        let _ = self.emit(ev).await;
    }
}

impl ResearchEngine {
    /// Start a research run and return its progress events.
    ///
    /// The sequence ends with exactly one `complete` or `error` event. Dropping the returned
    /// stream cancels the run at its next emit or wait.
    pub fn deep_research_stream(&self, req: ResearchRequest) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(req, tx).await });
        ReceiverStream::new(rx)
    }

    /// Sleep for `d`, but never past the run deadline. False if the consumer went away.
    async fn pause(&self, run: &Run, d: Duration) -> bool {
        let d = d.min(run.deadline.saturating_duration_since(Instant::now()));
        tokio::select! {
            _ = self.sleeper.sleep(d) => true,
            _ = run.tx.closed() => false,
        }
    }

    /// Forward decoded events until the stream ends. Also returns how many new events were
    /// emitted; a replayed `start` does not count.
    async fn drain(&self, run: &mut Run, lease: &Lease, mut events: EventStream) -> (Drained, usize) {
        let idle = self.config.stream_idle_timeout;
        let mut seen = 0;
        loop {
            let quiet_until = (Instant::now() + idle).min(run.deadline);
            let next = tokio::select! {
                r = timeout_at(quiet_until, events.next()) => match r {
                    Ok(item) => Next::Item(item),
                    Err(_) if Instant::now() >= run.deadline => Next::TimedOut,
                    Err(_) => Next::Idle,
                },
                _ = run.tx.closed() => Next::Closed,
            };
            let wire = match next {
                Next::Closed => return (Drained::Cancelled, seen),
                Next::TimedOut => return (Drained::TimedOut, seen),
                Next::Idle => {
                    let reason = format!("no stream event for {}s", idle.as_secs());
                    return (Drained::Broken(BackendError::Retryable(reason)), seen);
                }
                Next::Item(None) => return (Drained::Exhausted, seen),
                Next::Item(Some(Err(e))) => return (Drained::Broken(e), seen),
                Next::Item(Some(Ok(w))) => w,
            };
            let Some(ev) = run.decoder.decode(&wire) else {
                continue;
            };
            if ev.kind == ProgressKind::Start {
                self.pool.record_success(lease);
                // A resumed stream may replay the start event.
                if run.start_sent {
                    continue;
                }
                run.start_sent = true;
            }
            seen += 1;
            let terminal = ev.is_terminal();
            if !run.emit(ev).await {
                return (Drained::Cancelled, seen);
            }
            if terminal {
                return (Drained::Terminal, seen);
            }
        }
    }

    async fn timed_out(&self, run: &Run) {
        let msg = match run.interaction_id() {
            Some(id) => format!(
                "Research timed out after {:.0}s. Interaction ID: {id}",
                run.elapsed_s()
            ),
            None => format!(
                "Research timed out after {:.0}s before an interaction started",
                run.elapsed_s()
            ),
        };
        error!(elapsed_s = run.elapsed_s(), "research stream timed out");
        run.fail(FailureCode::Timeout, msg).await;
    }

    async fn connect_once(&self, run: &mut Run, req: &ResearchRequest, attempt: u32) -> Attempt {
        let lease = match self.pool.get() {
            Ok(l) => l,
            Err(e) => return Attempt::GiveUp(e.to_string()),
        };
        let opened = match timeout_at(run.deadline, lease.backend().create_stream(req)).await {
            Ok(r) => r,
            Err(_) => {
                self.timed_out(run).await;
                return Attempt::Stop;
            }
        };
        let events = match opened {
            Ok(Some(events)) => events,
            Ok(None) => {
                self.pool.record_failure(&lease);
                warn!(attempt, "create returned an empty stream");
                return Attempt::Retry;
            }
            Err(e) => {
                self.pool.record_failure(&lease);
                if !e.is_retryable() {
                    error!(attempt, error = %e, "create failed");
                    return Attempt::GiveUp(e.reason().to_string());
                }
                run.disconnects += 1;
                warn!(attempt, error = %e, "create failed, will retry");
                return Attempt::Retry;
            }
        };
        let (outcome, _) = self.drain(run, &lease, events).await;
        match outcome {
            Drained::Terminal | Drained::Cancelled => Attempt::Stop,
            Drained::TimedOut => {
                self.timed_out(run).await;
                Attempt::Stop
            }
            Drained::Exhausted if run.decoder.interaction_id().is_some() => {
                run.disconnects += 1;
                warn!("stream ended before completion");
                Attempt::Started
            }
            Drained::Exhausted => {
                self.pool.record_failure(&lease);
                warn!(attempt, "stream ended before interaction.start");
                Attempt::Retry
            }
            Drained::Broken(e) => {
                run.disconnects += 1;
                self.pool.record_failure(&lease);
                if run.decoder.interaction_id().is_some() {
                    warn!(error = %e, "stream dropped");
                    Attempt::Started
                } else if e.is_retryable() {
                    warn!(attempt, error = %e, "stream dropped before interaction.start");
                    Attempt::Retry
                } else {
                    Attempt::GiveUp(e.reason().to_string())
                }
            }
        }
    }

    pub(crate) async fn drive(self, req: ResearchRequest, tx: mpsc::Sender<ProgressEvent>) {
        let started = Instant::now();
        let mut run = Run {
            tx,
            decoder: EventDecoder::new(),
            started,
            deadline: started + self.config.stream_timeout,
            start_sent: false,
            disconnects: 0,
        };
        let max_initial = self.config.max_initial_retries;

        let mut attempts = 0;
        let mut last_error = None;
        while attempts < max_initial {
            attempts += 1;
            info!(attempt = attempts, max = max_initial, "connecting");
            match self.connect_once(&mut run, &req, attempts).await {
                Attempt::Stop => return,
                Attempt::Started => break,
                Attempt::GiveUp(reason) => {
                    last_error = Some(reason);
                    break;
                }
                Attempt::Retry => {}
            }
            if attempts < max_initial {
                let wait = self.config.initial_backoff.delay(attempts);
                if !self.pause(&run, wait).await {
                    return;
                }
            }
        }

        let Some(interaction_id) = run.interaction_id() else {
            self.pool.force_invalidate();
            let mut msg = format!(
                "Failed to start research after {attempts} attempts ({:.0}s). No interaction id received",
                run.elapsed_s()
            );
            if let Some(reason) = last_error {
                msg.push_str(&format!(": {reason}"));
            }
            msg.push_str(". The service may be overloaded; try again shortly.");
            error!(attempts, "research never started");
            run.fail(FailureCode::ConnectionFailed, msg).await;
            return;
        };

        self.reconnect(&mut run, &interaction_id).await;
    }

    async fn reconnect(&self, run: &mut Run, interaction_id: &str) {
        let max = self.config.max_stream_retries;
        let mut retries = 0;
        let mut total: u32 = 0;
        let mut consecutive_failures = 0;
        let mut last_error: Option<String> = None;

        while retries < max {
            retries += 1;
            total += 1;
            if Instant::now() >= run.deadline {
                self.timed_out(run).await;
                return;
            }
            let wait = self.config.stream_backoff.delay(retries);
            warn!(
                interaction_id,
                attempt = retries,
                max,
                wait_s = wait.as_secs_f64(),
                last_event_id = run.decoder.last_event_id(),
                "reconnecting"
            );
            let note = ProgressEvent::status(
                format!("Reconnecting (attempt {retries}/{max})"),
                Some(interaction_id.to_string()),
            );
            if !run.emit(note).await || !self.pause(run, wait).await {
                return;
            }
            if Instant::now() >= run.deadline {
                self.timed_out(run).await;
                return;
            }
            if consecutive_failures >= self.config.invalidate_after_failures {
                self.pool.force_invalidate();
            }
            let lease = match self.pool.get() {
                Ok(l) => l,
                Err(e) => {
                    last_error = Some(e.to_string());
                    break;
                }
            };
            let last = run.decoder.last_event_id().map(str::to_string);
            let opened = match timeout_at(
                run.deadline,
                lease.backend().resume_stream(interaction_id, last.as_deref()),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => {
                    self.timed_out(run).await;
                    return;
                }
            };
            let events = match opened {
                Ok(Some(events)) => events,
                Ok(None) => {
                    self.pool.record_failure(&lease);
                    consecutive_failures += 1;
                    warn!(interaction_id, "resume returned an empty stream");
                    continue;
                }
                Err(e) => {
                    self.pool.record_failure(&lease);
                    consecutive_failures += 1;
                    run.disconnects += 1;
                    if !e.is_retryable() {
                        error!(interaction_id, error = %e, "resume failed");
                        last_error = Some(e.reason().to_string());
                        break;
                    }
                    warn!(interaction_id, error = %e, "resume failed, will retry");
                    last_error = Some(e.reason().to_string());
                    continue;
                }
            };
            info!(interaction_id, "reconnected");
            let (outcome, seen) = self.drain(run, &lease, events).await;
            if seen > 0 {
                // The outage is over; the next one gets a fresh budget.
                retries = 0;
                consecutive_failures = 0;
                self.pool.record_success(&lease);
            }
            match outcome {
                Drained::Terminal | Drained::Cancelled => return,
                Drained::TimedOut => {
                    self.timed_out(run).await;
                    return;
                }
                Drained::Exhausted => {
                    run.disconnects += 1;
                    if seen == 0 {
                        consecutive_failures += 1;
                        self.pool.record_failure(&lease);
                    }
                    warn!(interaction_id, seen, "resumed stream ended before completion");
                }
                Drained::Broken(e) => {
                    run.disconnects += 1;
                    if seen == 0 {
                        consecutive_failures += 1;
                    }
                    self.pool.record_failure(&lease);
                    let fatal = !e.is_retryable();
                    warn!(interaction_id, error = %e, "resumed stream dropped");
                    last_error = Some(e.reason().to_string());
                    if fatal {
                        break;
                    }
                }
            }
        }

        let mut msg = format!(
            "Research interrupted after {:.0}s ({} disconnects, {total} reconnect attempts). Interaction ID: {interaction_id}.",
            run.elapsed_s(),
            run.disconnects,
        );
        if let Some(reason) = last_error {
            msg.push_str(&format!(" Last error: {reason}."));
        }
        msg.push_str(" The research may still be running; check its status later.");
        error!(interaction_id, disconnects = run.disconnects, total, "reconnect budget exhausted");
        run.fail(FailureCode::StreamDisconnected, msg).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::engine::tests::scripted;
    use crate::testing::{wire, Open, ScriptedBackend};
    use delve_core::{BackendError, FailureCode, ProgressEvent, ProgressKind, ResearchRequest};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn secs(v: &[u64]) -> Vec<Duration> {
        v.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    fn kinds(evs: &[ProgressEvent]) -> Vec<ProgressKind> {
        evs.iter().map(|e| e.kind).collect()
    }

    fn text_of(evs: &[ProgressEvent]) -> String {
        evs.iter()
            .filter(|e| e.kind == ProgressKind::Text)
            .filter_map(|e| e.content.as_deref())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn two_retryable_failures_then_success() {
        let backend = ScriptedBackend::default()
            .on_create(Open::Fail(BackendError::Retryable("gateway_timeout".into())))
            .on_create(Open::Fail(BackendError::Retryable("gateway_timeout".into())))
            .on_create(Open::events(vec![
                wire::start("int-1", "e1"),
                wire::thought("planning", "e2"),
                wire::text("Report", "e3"),
                wire::complete("e4"),
            ]));
        let (engine, backend, sleeper) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(
            kinds(&evs),
            vec![
                ProgressKind::Start,
                ProgressKind::Thought,
                ProgressKind::Text,
                ProgressKind::Complete
            ]
        );
        assert_eq!(text_of(&evs), "Report");
        assert_eq!(sleeper.slept(), secs(&[2, 4]));
        assert_eq!(backend.calls().creates, 3);
        assert!(backend.calls().resumes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn always_empty_fails_to_connect_after_budget() {
        let (engine, backend, sleeper) = scripted(ScriptedBackend::default(), EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].failure, Some(FailureCode::ConnectionFailed));
        assert!(evs[0].interaction_id.is_none());
        assert!(evs[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Failed to start research after 3 attempts"));
        assert_eq!(backend.calls().creates, 3);
        assert_eq!(sleeper.slept(), secs(&[2, 4]));
        assert!(engine.pool().snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_create_error_is_not_retried() {
        let backend = ScriptedBackend::default()
            .on_create(Open::Fail(BackendError::Fatal("API key not valid".into())));
        let (engine, backend, sleeper) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].failure, Some(FailureCode::ConnectionFailed));
        assert!(evs[0].content.as_deref().unwrap().contains("API key not valid"));
        assert_eq!(backend.calls().creates, 1);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_without_start_counts_as_failed_attempt() {
        let backend = ScriptedBackend::default()
            .on_create(Open::events(vec![wire::thought("orphan", "e0")]))
            .on_create(Open::events(vec![wire::start("int-1", "e1"), wire::complete("e2")]));
        let (engine, backend, sleeper) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(evs.last().map(|e| e.kind), Some(ProgressKind::Complete));
        assert_eq!(backend.calls().creates, 2);
        assert_eq!(sleeper.slept(), secs(&[2]));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_mid_stream_resumes_from_last_event_id() {
        let backend = ScriptedBackend::default()
            .on_create(Open::dropped_after(vec![
                wire::start("int-1", "e1"),
                wire::thought("t", "e2"),
                wire::text("Hello ", "e3"),
            ]))
            .on_resume(Open::events(vec![
                wire::start("int-1", "e1"),
                wire::text("World", "e4"),
                wire::complete("e5"),
            ]));
        let (engine, backend, sleeper) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(text_of(&evs), "Hello World");
        assert_eq!(
            evs.iter().filter(|e| e.kind == ProgressKind::Start).count(),
            1
        );
        assert_eq!(
            backend.calls().resumes,
            vec![("int-1".to_string(), Some("e3".to_string()))]
        );
        assert_eq!(sleeper.slept(), secs(&[2]));
        assert_eq!(evs.last().map(|e| e.kind), Some(ProgressKind::Complete));
        assert!(evs.iter().any(|e| e.kind == ProgressKind::Status));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_budget_exhaustion_is_stream_disconnected() {
        let backend =
            ScriptedBackend::default().on_create(Open::dropped_after(vec![wire::start("int-1", "e1")]));
        let (engine, backend, sleeper) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        let last = evs.last().unwrap();
        assert_eq!(last.failure, Some(FailureCode::StreamDisconnected));
        assert_eq!(last.interaction_id.as_deref(), Some("int-1"));
        assert!(last.content.as_deref().unwrap().contains("Interaction ID: int-1"));
        assert!(evs
            .iter()
            .all(|e| e.failure != Some(FailureCode::ConnectionFailed)));
        assert_eq!(backend.calls().resumes.len(), 5);
        assert_eq!(sleeper.slept(), secs(&[2, 4, 8, 16, 32]));
        // Three straight resume failures force a fresh connection.
        assert!(engine.pool().snapshot().unwrap().generation > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_ends_the_stream() {
        let backend = ScriptedBackend::default().on_create(Open::events(vec![
            wire::start("int-1", "e1"),
            wire::error("quota exhausted"),
            wire::text("never seen", "e3"),
        ]));
        let (engine, backend, _) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(kinds(&evs), vec![ProgressKind::Start, ProgressKind::Error]);
        assert_eq!(evs[1].failure, Some(FailureCode::ResearchFailed));
        assert!(backend.calls().resumes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_deadline_yields_timeout() {
        let cfg = EngineConfig {
            stream_timeout: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        let backend =
            ScriptedBackend::default().on_create(Open::dropped_after(vec![wire::start("int-1", "e1")]));
        let (engine, backend, sleeper) = scripted(backend, cfg);
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        let last = evs.last().unwrap();
        assert_eq!(last.failure, Some(FailureCode::Timeout));
        assert_eq!(last.interaction_id.as_deref(), Some("int-1"));
        // The third backoff (8s) is cut to the 4s left before the deadline.
        assert_eq!(sleeper.slept(), secs(&[2, 4, 4]));
        assert_eq!(backend.calls().resumes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_that_drop_before_any_event_rotate_the_connection() {
        let mut backend =
            ScriptedBackend::default().on_create(Open::dropped_after(vec![wire::start("int-1", "e1")]));
        for _ in 0..5 {
            // A replayed start is not progress.
            backend = backend.on_resume(Open::dropped_after(vec![wire::start("int-1", "e1")]));
        }
        let (engine, backend, sleeper) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(evs.last().unwrap().failure, Some(FailureCode::StreamDisconnected));
        assert_eq!(backend.calls().resumes.len(), 5);
        assert_eq!(sleeper.slept(), secs(&[2, 4, 8, 16, 32]));
        assert!(engine.pool().snapshot().unwrap().generation > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_without_completed_status_is_not_the_end() {
        let mut bare = wire::complete("e3");
        if let Some(i) = bare.interaction.as_mut() {
            i.status = None;
        }
        let backend = ScriptedBackend::default()
            .on_create(Open::events(vec![
                wire::start("int-1", "e1"),
                wire::text("partial", "e2"),
                bare,
            ]))
            .on_resume(Open::events(vec![wire::text(" and the rest", "e4"), wire::complete("e5")]));
        let (engine, backend, _) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(
            evs.iter().filter(|e| e.kind == ProgressKind::Complete).count(),
            1
        );
        assert_eq!(text_of(&evs), "partial and the rest");
        assert_eq!(
            backend.calls().resumes,
            vec![("int-1".to_string(), Some("e3".to_string()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_is_treated_as_a_drop() {
        let cfg = EngineConfig {
            stream_idle_timeout: Duration::from_secs(30),
            ..EngineConfig::default()
        };
        let backend = ScriptedBackend::default()
            .on_create(Open::Stalled(vec![
                wire::start("int-1", "e1"),
                wire::text("Hello ", "e2"),
            ]))
            .on_resume(Open::events(vec![wire::text("World", "e3"), wire::complete("e4")]));
        let (engine, backend, _) = scripted(backend, cfg);
        let started = tokio::time::Instant::now();
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(text_of(&evs), "Hello World");
        assert_eq!(evs.last().map(|e| e.kind), Some(ProgressKind::Complete));
        assert!(evs.iter().any(|e| e.kind == ProgressKind::Status));
        assert_eq!(
            backend.calls().resumes,
            vec![("int-1".to_string(), Some("e2".to_string()))]
        );
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn first_resume_without_any_event_id_omits_the_cursor() {
        let mut start = wire::start("int-1", "e1");
        start.event_id = None;
        let backend = ScriptedBackend::default()
            .on_create(Open::dropped_after(vec![start]))
            .on_resume(Open::events(vec![wire::text("Hi", "e2"), wire::complete("e3")]));
        let (engine, backend, _) = scripted(backend, EngineConfig::default());
        let evs: Vec<_> = engine.deep_research_stream(ResearchRequest::new("q")).collect().await;

        assert_eq!(text_of(&evs), "Hi");
        assert_eq!(backend.calls().resumes, vec![("int-1".to_string(), None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_stops_reconnecting() {
        let backend =
            ScriptedBackend::default().on_create(Open::dropped_after(vec![wire::start("int-1", "e1")]));
        let (engine, backend, _) = scripted(backend, EngineConfig::default());
        let mut events = engine.deep_research_stream(ResearchRequest::new("q"));
        let first = events.next().await.unwrap();
        assert_eq!(first.kind, ProgressKind::Start);
        drop(events);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(backend.calls().resumes.is_empty());
    }
}
