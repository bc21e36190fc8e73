//! Minimal MCP client for servers speaking the HTTP+SSE transport
//!
//! The server advertises a POST endpoint in an `endpoint` event on the
//! event stream; requests are POSTed there and responses arrive back on the
//! stream as `message` events.

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

use super::types::{ToolCallResult, ToolDescriptor};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// A dispatched server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental parser for `text/event-stream` bodies
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk of the body, returning every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Events decoded from a streaming HTTP response body
pub struct EventStream<S> {
    body: S,
    decoder: SseDecoder,
    pending: std::collections::VecDeque<SseEvent>,
}

impl<S, B> EventStream<S>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            decoder: SseDecoder::default(),
            pending: Default::default(),
        }
    }

    /// Next complete event, or `None` when the stream ends
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, String> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.decoder.feed(chunk.as_ref())),
                Some(Err(e)) => return Err(format!("event stream failed: {}", e)),
                None => return Ok(None),
            }
        }
    }

    /// Wait for the first event of the given type
    async fn expect_event(&mut self, event: &str) -> Result<SseEvent, String> {
        while let Some(next) = self.next_event().await? {
            if next.event == event {
                return Ok(next);
            }
        }
        Err(format!("event stream closed before '{}' event", event))
    }

    /// Wait for the JSON-RPC response with the given id
    async fn expect_response(&mut self, id: u64) -> Result<Value, String> {
        loop {
            let event = self.expect_event("message").await?;
            let message: Value = serde_json::from_str(&event.data)
                .map_err(|e| format!("malformed JSON-RPC message: {}", e))?;
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = message.get("error") {
                let detail = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(format!("server returned error: {}", detail));
            }
            return message
                .get("result")
                .cloned()
                .ok_or_else(|| "response carries no result".to_string());
        }
    }
}

#[derive(Deserialize)]
struct WireTool {
    name: String,
    description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
}

#[derive(Deserialize)]
struct WireToolList {
    tools: Vec<WireTool>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

async fn post_message(http: &reqwest::Client, endpoint: &Url, body: Value) -> Result<(), String> {
    let response = http
        .post(endpoint.clone())
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("failed to post to {}: {}", endpoint, e))?;
    if !response.status().is_success() {
        return Err(format!(
            "server rejected message with HTTP {}",
            response.status()
        ));
    }
    Ok(())
}

/// An initialized MCP session over one event stream
struct Session<'a, S> {
    http: &'a reqwest::Client,
    endpoint: Url,
    events: EventStream<S>,
    next_id: u64,
}

/// Open the event stream and run the initialize handshake
async fn connect<'a>(
    http: &'a reqwest::Client,
    url: &Url,
) -> Result<Session<'a, impl Stream<Item = reqwest::Result<impl AsRef<[u8]>>> + Unpin>, String> {
    let response = http
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| format!("failed to connect to {}: {}", url, e))?;
    if !response.status().is_success() {
        return Err(format!(
            "event stream request failed with HTTP {}",
            response.status()
        ));
    }

    let mut events = EventStream::new(Box::pin(response.bytes_stream()));

    let endpoint = events.expect_event("endpoint").await?;
    let endpoint = url
        .join(endpoint.data.trim())
        .map_err(|e| format!("invalid endpoint '{}': {}", endpoint.data, e))?;
    tracing::debug!(url = %url, endpoint = %endpoint, "SSE session established");

    let mut session = Session {
        http,
        endpoint,
        events,
        next_id: 1,
    };
    session
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
        .await?;
    session.notify("notifications/initialized").await?;

    Ok(session)
}

impl<S, B> Session<'_, S>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    /// Send a request and wait for its response on the event stream
    async fn request(&mut self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id;
        self.next_id += 1;
        post_message(
            self.http,
            &self.endpoint,
            json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        )
        .await?;
        self.events.expect_response(id).await
    }

    async fn notify(&self, method: &str) -> Result<(), String> {
        post_message(
            self.http,
            &self.endpoint,
            json!({ "jsonrpc": "2.0", "method": method }),
        )
        .await
    }
}

/// Run the initialize handshake and fetch every page of the tool list
pub async fn list_tools(http: &reqwest::Client, url: &Url) -> Result<Vec<ToolDescriptor>, String> {
    let mut session = connect(http, url).await?;

    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = match &cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let result = session.request("tools/list", params).await?;

        let page: WireToolList = serde_json::from_value(result)
            .map_err(|e| format!("malformed tools/list result: {}", e))?;
        tools.extend(
            page.tools
                .into_iter()
                .map(|t| ToolDescriptor::from_schema(t.name, t.description, &t.input_schema)),
        );

        match page.next_cursor {
            Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
            _ => break,
        }
    }

    Ok(tools)
}

/// Run the initialize handshake and invoke one tool
pub async fn call_tool(
    http: &reqwest::Client,
    url: &Url,
    tool: &str,
    arguments: Map<String, Value>,
) -> Result<ToolCallResult, String> {
    let mut session = connect(http, url).await?;
    let result = session
        .request("tools/call", json!({ "name": tool, "arguments": arguments }))
        .await?;
    ToolCallResult::from_wire(result)
}
