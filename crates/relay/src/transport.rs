//! Streamable HTTP transport to remote MCP endpoints.
//!
//! A POST of a JSON-RPC message can come back three ways: a plain JSON body,
//! an SSE stream whose first `message` event carries the response, or a bare
//! 202 for notifications. All three are normalized here so callers only ever
//! see a `ServerResult`.

use crate::error::TransportError;
use crate::session::ToolInfo;
use async_trait::async_trait;
use futures::StreamExt as _;
use rmcp::model::{
    CallToolResult, ClientCapabilities, ClientJsonRpcMessage, ClientRequest, Implementation,
    InitializeRequest, InitializeRequestParam, JsonRpcRequest, JsonRpcVersion2_0,
    ListToolsRequest, RequestId, ServerJsonRpcMessage, ServerResult,
};
use serde_json::Value;

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
const CLIENT_NAME: &str = "mcp-relay";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What `initialize` learned about the remote endpoint.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    /// Session id the endpoint assigned, echoed back on every later request.
    pub session_id: Option<String>,
    pub protocol_version: rmcp::model::ProtocolVersion,
    pub server_name: Option<String>,
}

/// A completed tools/call. Remote tool failures land here as data, not as
/// `Err`: `is_error` mirrors the JSON-RPC result's `isError`.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub is_error: bool,
    pub content: Vec<Value>,
}

/// Per-request target. Bundles the bits every wire operation needs so the
/// trait methods stay flat.
#[derive(Debug, Clone)]
pub struct Endpoint<'a> {
    pub url: &'a str,
    pub bearer: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn initialize(&self, endpoint: Endpoint<'_>) -> Result<RemoteSession, TransportError>;
    async fn list_tools(&self, endpoint: Endpoint<'_>) -> Result<Vec<ToolInfo>, TransportError>;
    async fn call_tool(
        &self,
        endpoint: Endpoint<'_>,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, TransportError>;
    /// Best effort; endpoints without session teardown just 405 this.
    async fn close(&self, endpoint: Endpoint<'_>) -> Result<(), TransportError>;
}

type SseEventStream = futures::stream::BoxStream<'static, Result<sse_stream::Sse, sse_stream::Error>>;

enum PostResponse {
    Json(ServerJsonRpcMessage, Option<String>),
    Sse(SseEventStream, Option<String>),
    Accepted,
}

pub struct StreamableHttpTransport {
    http: reqwest::Client,
}

impl StreamableHttpTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post_message(
        &self,
        endpoint: &Endpoint<'_>,
        message: ClientJsonRpcMessage,
    ) -> Result<PostResponse, TransportError> {
        let mut req = self
            .http
            .post(endpoint.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&message);
        if let Some(token) = endpoint.bearer {
            req = req.bearer_auth(token);
        }
        if let Some(sid) = endpoint.session_id {
            req = req.header(HEADER_SESSION_ID, sid);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized);
        }
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(PostResponse::Accepted);
        }
        if !status.is_success() {
            return Err(TransportError::Protocol(format!(
                "endpoint returned {status}"
            )));
        }

        let assigned = resp
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let stream = sse_stream::SseStream::from_bytes_stream(resp.bytes_stream()).boxed();
            return Ok(PostResponse::Sse(stream, assigned));
        }
        let msg: ServerJsonRpcMessage = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid response body: {e}")))?;
        Ok(PostResponse::Json(msg, assigned))
    }
}

async fn read_first_response(
    resp: PostResponse,
) -> Result<(ServerResult, Option<String>), TransportError> {
    match resp {
        PostResponse::Json(msg, assigned) => match msg {
            ServerJsonRpcMessage::Response(r) => Ok((r.result, assigned)),
            ServerJsonRpcMessage::Error(e) => Err(TransportError::Protocol(format!(
                "endpoint error: {}",
                e.error.message
            ))),
            other => Err(TransportError::Protocol(format!(
                "unexpected endpoint message: {other:?}"
            ))),
        },
        PostResponse::Sse(mut stream, assigned) => {
            while let Some(evt) = stream.next().await {
                let evt =
                    evt.map_err(|e| TransportError::Protocol(format!("sse error: {e}")))?;
                let payload = evt.data.unwrap_or_default();
                if payload.trim().is_empty() {
                    continue;
                }
                // Servers may interleave notifications the client model does
                // not know how to parse before the response arrives. Skip
                // anything that is not a response or an error.
                let msg: ServerJsonRpcMessage = match serde_json::from_str(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unparseable sse event");
                        continue;
                    }
                };
                match msg {
                    ServerJsonRpcMessage::Response(r) => return Ok((r.result, assigned)),
                    ServerJsonRpcMessage::Error(e) => {
                        return Err(TransportError::Protocol(format!(
                            "endpoint error: {}",
                            e.error.message
                        )));
                    }
                    _ => continue,
                }
            }
            Err(TransportError::Protocol(
                "sse stream ended before a response".to_string(),
            ))
        }
        PostResponse::Accepted => Err(TransportError::Protocol(
            "unexpected 202 for a request".to_string(),
        )),
    }
}

fn request(id: i64, request: ClientRequest) -> ClientJsonRpcMessage {
    ClientJsonRpcMessage::Request(JsonRpcRequest {
        jsonrpc: JsonRpcVersion2_0,
        id: RequestId::Number(id),
        request,
    })
}

pub(crate) fn tool_info_from_model(tool: &rmcp::model::Tool) -> ToolInfo {
    ToolInfo {
        name: tool.name.to_string(),
        description: tool.description.as_deref().map(str::to_string),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}

fn outcome_from_call_result(result: CallToolResult) -> ToolCallOutcome {
    ToolCallOutcome {
        is_error: result.is_error.unwrap_or(false),
        content: result
            .content
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect(),
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn initialize(&self, endpoint: Endpoint<'_>) -> Result<RemoteSession, TransportError> {
        let init = InitializeRequest::new(InitializeRequestParam {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: CLIENT_NAME.to_string(),
                version: CLIENT_VERSION.to_string(),
                ..Default::default()
            },
        });
        let resp = self
            .post_message(&endpoint, request(1, ClientRequest::InitializeRequest(init)))
            .await?;
        let (result, assigned) = read_first_response(resp).await?;
        let ServerResult::InitializeResult(init) = result else {
            return Err(TransportError::Protocol(
                "initialize returned a non-initialize result".to_string(),
            ));
        };

        let session_id = assigned.or_else(|| endpoint.session_id.map(str::to_string));
        let remote = RemoteSession {
            session_id: session_id.clone(),
            protocol_version: init.protocol_version.clone(),
            server_name: Some(init.server_info.name.to_string()),
        };

        // The initialized notification completes the handshake. Endpoints
        // answer it with a bare 202.
        let notif: ClientJsonRpcMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let follow_up = Endpoint {
            session_id: session_id.as_deref(),
            ..endpoint
        };
        match self.post_message(&follow_up, notif).await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(url = %endpoint.url, error = %e, "initialized notification failed");
            }
        }

        Ok(remote)
    }

    async fn list_tools(&self, endpoint: Endpoint<'_>) -> Result<Vec<ToolInfo>, TransportError> {
        let req = request(
            2,
            ClientRequest::ListToolsRequest(ListToolsRequest {
                method: rmcp::model::ListToolsRequestMethod,
                params: None,
                extensions: rmcp::model::Extensions::default(),
            }),
        );
        let resp = self.post_message(&endpoint, req).await?;
        let (result, _) = read_first_response(resp).await?;
        match result {
            ServerResult::ListToolsResult(r) => {
                Ok(r.tools.iter().map(tool_info_from_model).collect())
            }
            other => Err(TransportError::Protocol(format!(
                "tools/list returned {other:?}"
            ))),
        }
    }

    async fn call_tool(
        &self,
        endpoint: Endpoint<'_>,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, TransportError> {
        let req: ClientJsonRpcMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": name,
                "arguments": arguments,
            },
        }))
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let resp = self.post_message(&endpoint, req).await?;
        let (result, _) = read_first_response(resp).await?;
        match result {
            ServerResult::CallToolResult(r) => Ok(outcome_from_call_result(r)),
            other => Err(TransportError::Protocol(format!(
                "tools/call returned {other:?}"
            ))),
        }
    }

    async fn close(&self, endpoint: Endpoint<'_>) -> Result<(), TransportError> {
        let Some(sid) = endpoint.session_id else {
            return Ok(());
        };
        let mut req = self
            .http
            .delete(endpoint.url)
            .header(HEADER_SESSION_ID, sid);
        if let Some(token) = endpoint.bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tool_info_preserves_schema() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        });
        let schema_obj = schema.as_object().unwrap().clone();
        let tool = rmcp::model::Tool::new("search".to_string(), String::new(), Arc::new(schema_obj));

        let info = tool_info_from_model(&tool);
        assert_eq!(info.name, "search");
        assert_eq!(
            info.input_schema
                .get("required")
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(1)
        );
    }

    #[tokio::test]
    async fn first_response_skips_notifications_on_sse() {
        // The first two events do not deserialize into the client message
        // model at all; the third is the response.
        let body = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
            "data: server musings, not json\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}\n\n",
        );
        let bytes = futures::stream::iter(vec![Ok::<_, reqwest::Error>(bytes::Bytes::from_static(
            body.as_bytes(),
        ))]);
        let stream = sse_stream::SseStream::from_bytes_stream(bytes).boxed();
        let (result, _) = read_first_response(PostResponse::Sse(stream, None))
            .await
            .unwrap();
        match result {
            ServerResult::ListToolsResult(r) => assert!(r.tools.is_empty()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sse_stream_without_a_response_is_an_error() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n";
        let bytes = futures::stream::iter(vec![Ok::<_, reqwest::Error>(bytes::Bytes::from_static(
            body.as_bytes(),
        ))]);
        let stream = sse_stream::SseStream::from_bytes_stream(bytes).boxed();
        let err = read_first_response(PostResponse::Sse(stream, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ended before a response"));
    }

    #[tokio::test]
    async fn first_response_surfaces_jsonrpc_error() {
        let msg: ServerJsonRpcMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "session expired" },
        }))
        .unwrap();
        let err = read_first_response(PostResponse::Json(msg, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("session expired"));
    }
}
