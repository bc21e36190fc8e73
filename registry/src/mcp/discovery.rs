//! Tool discovery and invocation against running MCP servers

use std::time::Duration;

use anyhow::Context;
use rmcp::{model::CallToolRequestParam, service::Peer, RoleClient};
use serde_json::{Map, Value};
use url::Url;

use super::sse;
use super::types::{ToolCallResult, ToolDescriptor};
use crate::error::{RegistryError, RegistryResult};

/// How to reach a running server's MCP session
#[derive(Clone)]
pub enum ToolEndpoint {
    /// Session over the process's stdin/stdout, established at start
    Stdio(Peer<RoleClient>),
    /// HTTP event-stream endpoint served by the process
    Sse(Url),
}

/// Queries running servers for their tool catalog and invokes their tools
///
/// Both operations share one timeout.
#[derive(Clone)]
pub struct ToolDiscoveryClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl ToolDiscoveryClient {
    pub fn new(timeout: Duration) -> RegistryResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch the tool list, bounded by the discovery timeout
    pub async fn list_tools(
        &self,
        id: &str,
        endpoint: &ToolEndpoint,
    ) -> RegistryResult<Vec<ToolDescriptor>> {
        tracing::debug!(server = %id, "Discovering tools");

        let discovery = async {
            match endpoint {
                ToolEndpoint::Stdio(peer) => list_stdio_tools(peer).await,
                ToolEndpoint::Sse(url) => sse::list_tools(&self.http, url).await,
            }
        };

        match tokio::time::timeout(self.timeout, discovery).await {
            Ok(Ok(tools)) => {
                tracing::debug!(server = %id, count = tools.len(), "Discovered tools");
                Ok(tools)
            }
            Ok(Err(message)) => {
                tracing::warn!(server = %id, "Tool discovery failed: {}", message);
                Err(RegistryError::discovery(id, message))
            }
            Err(_) => {
                tracing::warn!(server = %id, "Tool discovery timed out after {:?}", self.timeout);
                Err(RegistryError::DiscoveryTimeout {
                    id: id.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Invoke one tool, bounded by the same timeout as discovery
    pub async fn call_tool(
        &self,
        id: &str,
        endpoint: &ToolEndpoint,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> RegistryResult<ToolCallResult> {
        tracing::debug!(server = %id, tool = %tool, "Calling tool");

        let call = async {
            match endpoint {
                ToolEndpoint::Stdio(peer) => call_stdio_tool(peer, tool, arguments).await,
                ToolEndpoint::Sse(url) => sse::call_tool(&self.http, url, tool, arguments).await,
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => {
                tracing::debug!(
                    server = %id,
                    tool = %tool,
                    is_error = result.is_error,
                    "Tool call finished"
                );
                Ok(result)
            }
            Ok(Err(message)) => {
                tracing::warn!(server = %id, tool = %tool, "Tool call failed: {}", message);
                Err(RegistryError::tool_call(id, tool, message))
            }
            Err(_) => {
                tracing::warn!(
                    server = %id,
                    tool = %tool,
                    "Tool call timed out after {:?}",
                    self.timeout
                );
                Err(RegistryError::ToolCallTimeout {
                    id: id.to_string(),
                    tool: tool.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

async fn call_stdio_tool(
    peer: &Peer<RoleClient>,
    tool: &str,
    arguments: Map<String, Value>,
) -> Result<ToolCallResult, String> {
    let result = peer
        .call_tool(CallToolRequestParam {
            name: tool.to_string().into(),
            arguments: Some(arguments),
            task: None,
        })
        .await
        .map_err(|e| format!("tools/call failed: {}", e))?;

    let result = serde_json::to_value(&result)
        .map_err(|e| format!("malformed tools/call result: {}", e))?;
    ToolCallResult::from_wire(result)
}

async fn list_stdio_tools(peer: &Peer<RoleClient>) -> Result<Vec<ToolDescriptor>, String> {
    let tools = peer
        .list_all_tools()
        .await
        .map_err(|e| format!("tools/list failed: {}", e))?;

    Ok(tools
        .into_iter()
        .map(|t| {
            let schema = Value::Object(t.input_schema.as_ref().clone());
            ToolDescriptor::from_schema(
                t.name.to_string(),
                t.description.map(|d| d.to_string()),
                &schema,
            )
        })
        .collect())
}
