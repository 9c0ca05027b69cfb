use crate::config::GeminiConfig;
use crate::retry::RetryClassifier;
use delve_core::{
    Backend, BackendError, BackendResult, EventStream, GenerateRequest, GroundedResponse,
    InteractionSnapshot, ModelBackend, ResearchBackend, ResearchRequest, Source, WireEvent,
};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const GET_TIMEOUT: Duration = Duration::from_secs(60);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gemini Interactions API (deep research agent) plus `generateContent`.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    agent: String,
    classifier: RetryClassifier,
}

/// Fresh HTTP client per logical connection. Streaming requests carry no total timeout.
pub fn http_client() -> delve_core::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("delve/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| delve_core::Error::NotConfigured(format!("http client: {e}")))
}

/// Pool connector: reads config from the environment on every (re)connect.
pub fn connect_from_env() -> delve_core::Result<Arc<dyn Backend>> {
    let cfg = GeminiConfig::from_env()?;
    Ok(Arc::new(GeminiClient::new(http_client()?, cfg)))
}

#[derive(Serialize)]
struct CreateBody<'a> {
    input: String,
    agent: &'a str,
    background: bool,
    stream: bool,
    agent_config: AgentConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct AgentConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    thinking_summaries: &'static str,
}

#[derive(Serialize)]
struct FollowupBody<'a> {
    model: &'a str,
    input: &'a str,
    previous_interaction_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
    include_thoughts: bool,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client, cfg: GeminiConfig) -> Self {
        Self {
            client,
            api_key: cfg.api_key,
            base_url: cfg.base_url,
            agent: cfg.agent,
            classifier: cfg.classifier,
        }
    }

    pub fn from_env(client: reqwest::Client) -> delve_core::Result<Self> {
        Ok(Self::new(client, GeminiConfig::from_env()?))
    }

    fn endpoint(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = Url::parse(self.base_url.trim_end_matches('/'))
            .map_err(|e| BackendError::Fatal(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Fatal("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push("v1beta")
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("x-goog-api-key", &self.api_key)
    }

    async fn send(&self, rb: reqwest::RequestBuilder) -> BackendResult<reqwest::Response> {
        let resp = rb
            .send()
            .await
            .map_err(|e| self.classifier.classify_reqwest(&e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(self.classifier.classify_status(status.as_u16(), &body))
    }

    async fn json(&self, rb: reqwest::RequestBuilder) -> BackendResult<serde_json::Value> {
        let resp = self.send(rb).await?;
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| self.classifier.classify_reqwest(&e))
    }

    async fn open_stream(&self, rb: reqwest::RequestBuilder) -> BackendResult<Option<EventStream>> {
        let resp = self.send(rb.header(reqwest::header::ACCEPT, "text/event-stream")).await?;
        first_or_none(sse_events(resp, self.classifier.clone())).await
    }
}

fn frame_to_event(data: &str, id: &str) -> Option<WireEvent> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<WireEvent>(data) {
        Ok(mut ev) => {
            if ev.event_id.is_none() && !id.is_empty() {
                ev.event_id = Some(id.to_string());
            }
            Some(ev)
        }
        Err(e) => {
            warn!(error = %e, "skipping malformed stream event");
            None
        }
    }
}

/// Decode a streaming response body into wire events.
///
/// A transport or framing error mid-body becomes one classified `Err` item, then the stream ends.
fn sse_events(resp: reqwest::Response, classifier: RetryClassifier) -> EventStream {
    resp.bytes_stream()
        .eventsource()
        .scan(false, move |failed, item| {
            if *failed {
                return futures_util::future::ready(None);
            }
            let out = match item {
                Ok(frame) => frame_to_event(&frame.data, &frame.id).map(Ok),
                Err(EventStreamError::Transport(e)) => {
                    *failed = true;
                    Some(Err(classifier.classify_reqwest(&e)))
                }
                Err(e) => {
                    *failed = true;
                    Some(Err(BackendError::Retryable(format!("malformed event stream: {e}"))))
                }
            };
            futures_util::future::ready(Some(out))
        })
        .filter_map(futures_util::future::ready)
        .boxed()
}

/// `Ok(None)` when the body ended before producing a single event.
async fn first_or_none(mut events: EventStream) -> BackendResult<Option<EventStream>> {
    match events.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(e),
        Some(Ok(first)) => Ok(Some(
            futures_util::stream::once(async move { Ok(first) })
                .chain(events)
                .boxed(),
        )),
    }
}

#[async_trait::async_trait]
impl ResearchBackend for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn create_stream(&self, req: &ResearchRequest) -> BackendResult<Option<EventStream>> {
        let mut url = self.endpoint(&["interactions"])?;
        url.query_pairs_mut().append_pair("alt", "sse");
        let tools = if req.file_search_store_names.is_empty() {
            Vec::new()
        } else {
            vec![serde_json::json!({
                "type": "file_search",
                "file_search_store_names": req.file_search_store_names,
            })]
        };
        let body = CreateBody {
            input: req.prompt(),
            agent: req.agent.as_deref().unwrap_or(&self.agent),
            background: true,
            stream: true,
            agent_config: AgentConfig {
                kind: "deep-research",
                thinking_summaries: "auto",
            },
            tools,
        };
        debug!(agent = body.agent, "creating interaction");
        self.open_stream(self.request(reqwest::Method::POST, url).json(&body))
            .await
    }

    async fn resume_stream(
        &self,
        interaction_id: &str,
        last_event_id: Option<&str>,
    ) -> BackendResult<Option<EventStream>> {
        let mut url = self.endpoint(&["interactions", interaction_id])?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("stream", "true").append_pair("alt", "sse");
            if let Some(last) = last_event_id {
                q.append_pair("last_event_id", last);
            }
        }
        debug!(interaction_id, last_event_id, "resuming interaction stream");
        self.open_stream(self.request(reqwest::Method::GET, url)).await
    }

    async fn get_interaction(&self, interaction_id: &str) -> BackendResult<InteractionSnapshot> {
        let url = self.endpoint(&["interactions", interaction_id])?;
        let v = self
            .json(self.request(reqwest::Method::GET, url).timeout(GET_TIMEOUT))
            .await?;
        Ok(InteractionSnapshot::from_value(v))
    }

    async fn followup(
        &self,
        previous_interaction_id: &str,
        input: &str,
        model: &str,
    ) -> BackendResult<InteractionSnapshot> {
        let url = self.endpoint(&["interactions"])?;
        let body = FollowupBody {
            model,
            input,
            previous_interaction_id,
        };
        let v = self
            .json(
                self.request(reqwest::Method::POST, url)
                    .timeout(GENERATE_TIMEOUT)
                    .json(&body),
            )
            .await?;
        Ok(InteractionSnapshot::from_value(v))
    }
}

#[async_trait::async_trait]
impl ModelBackend for GeminiClient {
    async fn generate(&self, req: &GenerateRequest) -> BackendResult<GroundedResponse> {
        let model_call = format!("{}:generateContent", req.model);
        let url = self.endpoint(&["models", &model_call])?;
        let thinking_config = req.thinking_budget.map(|b| ThinkingConfig {
            thinking_budget: b,
            include_thoughts: req.include_thoughts,
        });
        let generation_config = GenerationConfig {
            temperature: req.temperature,
            thinking_config,
            response_mime_type: req.response_schema.as_ref().map(|_| "application/json"),
            response_schema: req.response_schema.clone(),
        };
        let body = GenerateBody {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: req.prompt.clone(),
                }],
            }],
            system_instruction: req.system_instruction.as_ref().map(|s| Content {
                role: None,
                parts: vec![Part { text: s.clone() }],
            }),
            tools: if req.grounded {
                vec![serde_json::json!({ "google_search": {} })]
            } else {
                Vec::new()
            },
            generation_config: Some(generation_config),
        };
        let v = self
            .json(
                self.request(reqwest::Method::POST, url)
                    .timeout(GENERATE_TIMEOUT)
                    .json(&body),
            )
            .await?;
        parse_generate_response(&v)
    }
}

fn get_either<'a>(v: &'a serde_json::Value, camel: &str, snake: &str) -> Option<&'a serde_json::Value> {
    v.get(camel).or_else(|| v.get(snake))
}

/// Pull text, thought summary and grounding metadata out of a `generateContent` reply.
pub(crate) fn parse_generate_response(v: &serde_json::Value) -> BackendResult<GroundedResponse> {
    let Some(candidate) = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        let reason = get_either(v, "promptFeedback", "prompt_feedback")
            .and_then(|f| get_either(f, "blockReason", "block_reason"))
            .and_then(|r| r.as_str())
            .unwrap_or("no candidates");
        return Err(BackendError::Fatal(format!("empty generateContent reply: {reason}")));
    };

    let mut text = String::new();
    let mut thought = String::new();
    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for part in parts {
        let Some(t) = part.get("text").and_then(|t| t.as_str()) else {
            continue;
        };
        if part.get("thought").and_then(|b| b.as_bool()).unwrap_or(false) {
            thought.push_str(t);
        } else {
            text.push_str(t);
        }
    }

    let mut web_search_queries = Vec::new();
    let mut sources = Vec::new();
    if let Some(meta) = get_either(candidate, "groundingMetadata", "grounding_metadata") {
        if let Some(qs) = get_either(meta, "webSearchQueries", "web_search_queries").and_then(|q| q.as_array()) {
            web_search_queries.extend(qs.iter().filter_map(|q| q.as_str()).map(str::to_string));
        }
        if let Some(chunks) = get_either(meta, "groundingChunks", "grounding_chunks").and_then(|c| c.as_array()) {
            for web in chunks.iter().filter_map(|c| c.get("web")) {
                let uri = web.get("uri").and_then(|u| u.as_str()).unwrap_or_default();
                if uri.is_empty() || sources.iter().any(|s: &Source| s.uri == uri) {
                    continue;
                }
                sources.push(Source {
                    uri: uri.to_string(),
                    title: web
                        .get("title")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
    }

    Ok(GroundedResponse {
        text,
        thought: Some(thought).filter(|t| !t.is_empty()),
        web_search_queries,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> GeminiClient {
        GeminiClient::new(
            reqwest::Client::new(),
            GeminiConfig {
                api_key: "k".into(),
                base_url: base.into(),
                agent: "agent-x".into(),
                classifier: RetryClassifier::default(),
            },
        )
    }

    #[test]
    fn endpoints_escape_interaction_ids() {
        let c = client("https://example.test/");
        let u = c.endpoint(&["interactions", "a/b c"]).unwrap();
        assert_eq!(u.as_str(), "https://example.test/v1beta/interactions/a%2Fb%20c");
        let m = c.endpoint(&["models", "gemini-2.5-flash:generateContent"]).unwrap();
        assert_eq!(
            m.as_str(),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn sse_frames_become_wire_events() {
        let data = r#"{"event_type":"content.delta","delta":{"type":"text","text":"hi"}}"#;
        let ev = frame_to_event(data, "e5").unwrap();
        assert_eq!(ev.event_id.as_deref(), Some("e5"));
        assert!(frame_to_event(data, "").unwrap().event_id.is_none());
        assert!(frame_to_event("[DONE]", "e6").is_none());
        assert!(frame_to_event("{not json", "").is_none());
    }

    #[test]
    fn generate_reply_splits_thoughts_and_dedups_sources() {
        let v = serde_json::json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "Answer "},
                    {"text": "here."}
                ]},
                "groundingMetadata": {
                    "webSearchQueries": ["q1"],
                    "groundingChunks": [
                        {"web": {"uri": "https://a.test", "title": "A"}},
                        {"web": {"uri": "https://a.test", "title": "A again"}},
                        {"web": {"uri": "https://b.test"}}
                    ]
                }
            }]
        });
        let r = parse_generate_response(&v).unwrap();
        assert_eq!(r.text, "Answer here.");
        assert_eq!(r.thought.as_deref(), Some("pondering"));
        assert_eq!(r.web_search_queries, vec!["q1".to_string()]);
        assert_eq!(r.sources.len(), 2);
        assert_eq!(r.sources[1].title, "");
    }

    #[test]
    fn blocked_prompt_is_fatal() {
        let v = serde_json::json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let e = parse_generate_response(&v).unwrap_err();
        assert!(!e.is_retryable());
        assert!(e.reason().contains("SAFETY"));
    }
}
