//! Tool-invocation protocol session (MCP over stdio).
//!
//! Messages are JSON-RPC 2.0 objects, one per line. The session performs the
//! `initialize` handshake, then serves `tools/list` and `tools/call` for the
//! agent loop. Notifications from the server are skipped; pings are answered.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::AgentError;
use crate::llm::ToolDefinition;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on a single protocol message.
const MAX_MESSAGE_BYTES: u64 = 10 * 1024 * 1024;

/// Output of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Text parts joined by newlines, or the raw result when there are none.
    pub text: String,
    /// The tool reported failure (`isError`, or a JSON-RPC error reply).
    pub is_error: bool,
}

/// What the agent loop needs from a live tool session.
#[async_trait]
pub trait ToolSession: Send {
    async fn list_tools(&mut self) -> Result<Vec<ToolDefinition>, AgentError>;

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolOutput, AgentError>;
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

/// A JSON-RPC client session over a reader/writer pair.
pub struct McpSession<R, W> {
    reader: R,
    writer: W,
    next_id: u64,
    server_info: Value,
}

impl<R, W> McpSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Run the `initialize` handshake and return a ready session.
    pub async fn initialize(reader: R, writer: W) -> Result<Self, AgentError> {
        let mut session = Self {
            reader,
            writer,
            next_id: 1,
            server_info: Value::Null,
        };

        let result = session
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "mcp-jobs", "version": env!("CARGO_PKG_VERSION") }
                }),
            )
            .await?
            .map_err(|e| AgentError::Protocol(format!("initialize rejected: {e}")))?;

        session.server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        session.notify("notifications/initialized").await?;
        debug!(server = %session.server_info, "Toolkit session initialized");
        Ok(session)
    }

    /// `serverInfo` reported during the handshake.
    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    /// Send a request and wait for its reply.
    ///
    /// The outer error is a transport or framing failure; the inner one is a
    /// JSON-RPC error object rendered as `code: message`.
    async fn request(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<Result<Value, String>, AgentError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({
            "jsonrpc": "2.0", "id": id, "method": method, "params": params
        }))
        .await?;

        let reply = loop {
            let msg = self.read_message().await?;
            let msg_id = msg.get("id").filter(|v| !v.is_null()).cloned();
            let msg_method = msg.get("method").and_then(Value::as_str).map(str::to_string);

            match (msg_id, msg_method) {
                (None, Some(notification)) => {
                    trace!(method = %notification, "Skipping toolkit notification");
                }
                (Some(req_id), Some(server_method)) => {
                    self.answer_server_request(req_id, &server_method).await?;
                }
                (Some(resp_id), None) => {
                    if resp_id.as_u64() != Some(id) {
                        return Err(AgentError::Protocol(format!(
                            "response id mismatch for {method} (expected {id}, got {resp_id})"
                        )));
                    }
                    break msg;
                }
                (None, None) => {
                    return Err(AgentError::Protocol(format!(
                        "message without id or method while waiting for {method}"
                    )));
                }
            }
        };

        if let Some(err) = reply.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Ok(Err(format!("{code}: {message}")));
        }

        reply
            .get("result")
            .cloned()
            .map(Ok)
            .ok_or_else(|| AgentError::Protocol(format!("{method} response missing 'result'")))
    }

    async fn notify(&mut self, method: &str) -> Result<(), AgentError> {
        self.send(&json!({ "jsonrpc": "2.0", "method": method })).await
    }

    async fn answer_server_request(&mut self, id: Value, method: &str) -> Result<(), AgentError> {
        let reply = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            json!({
                "jsonrpc": "2.0", "id": id,
                "error": { "code": -32601, "message": format!("method not supported: {method}") }
            })
        };
        self.send(&reply).await
    }

    async fn send(&mut self, msg: &Value) -> Result<(), AgentError> {
        let mut line = msg.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Protocol(format!("write to toolkit failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AgentError::Protocol(format!("flush to toolkit failed: {e}")))
    }

    async fn read_message(&mut self) -> Result<Value, AgentError> {
        loop {
            let mut line = String::new();
            let n = (&mut self.reader)
                .take(MAX_MESSAGE_BYTES + 1)
                .read_line(&mut line)
                .await
                .map_err(|e| AgentError::Protocol(format!("read from toolkit failed: {e}")))?;

            if n == 0 {
                return Err(AgentError::Protocol(
                    "toolkit closed its output stream (process likely exited)".to_string(),
                ));
            }
            if n as u64 > MAX_MESSAGE_BYTES {
                return Err(AgentError::Protocol(format!(
                    "toolkit message exceeds {MAX_MESSAGE_BYTES} bytes"
                )));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map_err(|e| {
                AgentError::Protocol(format!("malformed message from toolkit: {e}"))
            });
        }
    }
}

#[async_trait]
impl<R, W> ToolSession for McpSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn list_tools(&mut self) -> Result<Vec<ToolDefinition>, AgentError> {
        let result = self
            .request("tools/list", json!({}))
            .await?
            .map_err(|e| AgentError::Protocol(format!("tools/list failed: {e}")))?;

        let tools: Vec<WireTool> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or_else(|| json!([])),
        )
        .map_err(|e| AgentError::Protocol(format!("tools/list: bad tool entry: {e}")))?;

        debug!(count = tools.len(), "Discovered toolkit tools");
        Ok(tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description.unwrap_or_default(),
                parameters: t
                    .input_schema
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            })
            .collect())
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolOutput, AgentError> {
        let reply = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        let result = match reply {
            Ok(result) => result,
            Err(e) => {
                return Ok(ToolOutput {
                    text: format!("tool error {e}"),
                    is_error: true,
                });
            }
        };

        let text_parts: Vec<&str> = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        let text = if text_parts.is_empty() {
            result.to_string()
        } else {
            text_parts.join("\n")
        };

        Ok(ToolOutput {
            text,
            is_error: result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type Session = McpSession<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

    /// Spawn a fake toolkit that answers each request with `respond`.
    /// Returning `None` sends nothing.
    fn fake_toolkit<F>(respond: F) -> DuplexStream
    where
        F: Fn(&Value) -> Vec<Value> + Send + 'static,
    {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let (read, mut write) = split(server);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                for reply in respond(&msg) {
                    let mut out = reply.to_string();
                    out.push('\n');
                    if write.write_all(out.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        client
    }

    fn standard(msg: &Value) -> Vec<Value> {
        let id = msg.get("id").cloned();
        match msg["method"].as_str() {
            Some("initialize") => vec![json!({
                "jsonrpc": "2.0", "id": id,
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "1"}
                }
            })],
            Some("tools/list") => vec![json!({
                "jsonrpc": "2.0", "id": id,
                "result": {"tools": [
                    {"name": "search_gmail", "description": "Search mail",
                     "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}},
                    {"name": "bare"}
                ]}
            })],
            Some("tools/call") => vec![
                json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
                json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"content": [
                        {"type": "text", "text": "first"},
                        {"type": "text", "text": "second"}
                    ]}
                }),
            ],
            _ => vec![],
        }
    }

    async fn connect<F>(respond: F) -> Result<Session, AgentError>
    where
        F: Fn(&Value) -> Vec<Value> + Send + 'static,
    {
        let (read, write) = split(fake_toolkit(respond));
        McpSession::initialize(BufReader::new(read), write).await
    }

    #[tokio::test]
    async fn handshake_and_list_tools() {
        let mut session = connect(standard).await.unwrap();
        assert_eq!(session.server_info()["name"], "fake");

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search_gmail");
        assert_eq!(tools[0].parameters["properties"]["q"]["type"], "string");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].parameters["type"], "object");
    }

    #[tokio::test]
    async fn call_tool_skips_notifications_and_joins_text() {
        let mut session = connect(standard).await.unwrap();
        let out = session
            .call_tool("search_gmail", json!({"q": "is:unread"}))
            .await
            .unwrap();
        assert_eq!(out.text, "first\nsecond");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn tool_error_reply_is_reported_not_raised() {
        let mut session = connect(|msg| {
            if msg["method"] == "tools/call" {
                vec![json!({
                    "jsonrpc": "2.0", "id": msg["id"],
                    "error": {"code": -32602, "message": "bad arguments"}
                })]
            } else {
                standard(msg)
            }
        })
        .await
        .unwrap();

        let out = session.call_tool("x", json!({})).await.unwrap();
        assert!(out.is_error);
        assert!(out.text.contains("-32602: bad arguments"));
    }

    #[tokio::test]
    async fn is_error_flag_is_surfaced() {
        let mut session = connect(|msg| {
            if msg["method"] == "tools/call" {
                vec![json!({
                    "jsonrpc": "2.0", "id": msg["id"],
                    "result": {"content": [{"type": "text", "text": "quota exceeded"}], "isError": true}
                })]
            } else {
                standard(msg)
            }
        })
        .await
        .unwrap();

        let out = session.call_tool("x", json!({})).await.unwrap();
        assert!(out.is_error);
        assert_eq!(out.text, "quota exceeded");
    }

    #[tokio::test]
    async fn mismatched_id_is_protocol_failure() {
        let err = connect(|msg| {
            vec![json!({"jsonrpc": "2.0", "id": msg["id"].as_u64().unwrap() + 7, "result": {}})]
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AgentError::Protocol(ref m) if m.contains("id mismatch")));
    }

    #[tokio::test]
    async fn garbage_line_is_protocol_failure() {
        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let (_read, mut write) = split(server);
            write.write_all(b"this is not json\n").await.unwrap();
            // Keep the stream open.
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });
        let (read, write) = split(client);
        let err = McpSession::initialize(BufReader::new(read), write)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("malformed message"));
    }

    #[tokio::test]
    async fn closed_stream_is_protocol_failure() {
        let (client, server) = duplex(1024);
        drop(server);
        let (read, write) = split(client);
        let err = McpSession::initialize(BufReader::new(read), write)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[tokio::test]
    async fn server_ping_is_answered() {
        let mut session = connect(|msg| {
            if msg["method"] == "tools/list" {
                vec![
                    json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}),
                    json!({"jsonrpc": "2.0", "id": msg["id"], "result": {"tools": []}}),
                ]
            } else {
                standard(msg)
            }
        })
        .await
        .unwrap();
        assert!(session.list_tools().await.unwrap().is_empty());
    }
}
