use super::tools::{DeepArgs, FollowupArgs, QuickArgs, StatusArgs, Tools};
use delve_core::ProgressEvent;
use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use tracing::{debug, info};

fn tool_result(payload: serde_json::Value) -> CallToolResult {
    // Structured content for machine consumers, plus a text copy for clients that only read
    // `content[0].text`.
    let mut r = CallToolResult::structured(payload.clone());
    r.content = vec![Content::text(payload.to_string())];
    r
}

#[derive(Clone)]
pub(crate) struct DelveMcp {
    tool_router: RmcpToolRouter<Self>,
    tools: Tools,
}

#[tool_router]
impl DelveMcp {
    pub(crate) fn new(tools: Tools) -> Self {
        Self {
            tool_router: Self::tool_router(),
            tools,
        }
    }

    #[tool(description = "Report delve configuration, effective limits and version (no secrets)")]
    async fn delve_meta(&self) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.tools.meta()))
    }

    #[tool(
        description = "Fast grounded answer from one web-search-backed model call (seconds). Returns text, sources and the search queries used."
    )]
    async fn research_quick(
        &self,
        params: Parameters<Option<QuickArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        Ok(tool_result(self.tools.quick(args).await))
    }

    #[tool(
        description = "Deep multi-step research with a background agent (minutes). Survives stream drops by resuming from the last event, falls back to polling, and can optionally self-critique (auto_refine) and fact-check against web search (grounded)."
    )]
    async fn research_deep(
        &self,
        params: Parameters<Option<DeepArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let payload = self
            .tools
            .deep(args, |ev: &ProgressEvent| {
                debug!(kind = ?ev.kind, interaction_id = ev.interaction_id.as_deref(), "progress");
            })
            .await;
        Ok(tool_result(payload))
    }

    #[tool(description = "Current status of a research interaction; includes the report once completed")]
    async fn research_status(
        &self,
        params: Parameters<Option<StatusArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        Ok(tool_result(self.tools.status(args).await))
    }

    #[tool(description = "Ask a follow-up question in the context of a finished research interaction")]
    async fn research_followup(
        &self,
        params: Parameters<Option<FollowupArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        Ok(tool_result(self.tools.followup(args).await))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for DelveMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Deep research over a resumable agent stream. Prefer research_quick for simple questions; research_deep runs for minutes. Outputs are JSON and schema-versioned; on stream_disconnected or timeout, check research_status with the returned interaction_id."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub(crate) async fn serve_stdio() -> Result<(), McpError> {
    let svc = DelveMcp::new(Tools::from_env());
    info!("serving MCP on stdio");
    let running = svc
        .serve(stdio())
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    running
        .waiting()
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p<T>(v: T) -> Parameters<Option<T>> {
        Parameters(Some(v))
    }

    fn payload_from_call_tool_result(r: &CallToolResult) -> serde_json::Value {
        let s = r
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default();
        serde_json::from_str(&s).expect("tool result should be a JSON string")
    }

    #[tokio::test]
    async fn tool_results_carry_text_and_structured_copies() {
        let svc = DelveMcp::new(Tools::from_env());
        let r = svc.delve_meta().await.unwrap();
        let v = payload_from_call_tool_result(&r);
        assert_eq!(r.structured_content.as_ref(), Some(&v));
        assert_eq!(v["kind"].as_str(), Some("delve_meta"));
        assert_eq!(v["ok"].as_bool(), Some(true));
    }

    #[tokio::test]
    async fn missing_arguments_are_invalid_params() {
        let svc = DelveMcp::new(Tools::from_env());
        let r = svc.research_status(Parameters(None)).await.unwrap();
        let v = payload_from_call_tool_result(&r);
        assert_eq!(v["kind"].as_str(), Some("research_status"));
        assert_eq!(v["error"]["code"].as_str(), Some("invalid_params"));

        let r = svc
            .research_quick(p(QuickArgs {
                query: Some(String::new()),
                ..QuickArgs::default()
            }))
            .await
            .unwrap();
        let v = payload_from_call_tool_result(&r);
        assert_eq!(v["error"]["code"].as_str(), Some("invalid_params"));
        assert_eq!(v["schema_version"].as_u64(), Some(1));
    }
}
