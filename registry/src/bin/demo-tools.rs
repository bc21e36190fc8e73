//! Small stdio MCP server for trying the registry out
//!
//! Register it with `command = "demo-tools"` and `connection_type = "stdio"`.

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoParams {
    #[schemars(description = "Text to send back")]
    pub text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddParams {
    #[schemars(description = "First addend")]
    pub a: i64,
    #[schemars(description = "Second addend")]
    pub b: i64,
}

#[derive(Clone)]
pub struct DemoToolsServer {
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl DemoToolsServer {
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Echo the given text")]
    async fn echo(
        &self,
        Parameters(params): Parameters<EchoParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(params.text)]))
    }

    #[tool(description = "Add two integers")]
    async fn add(
        &self,
        Parameters(params): Parameters<AddParams>,
    ) -> Result<CallToolResult, McpError> {
        let sum = params
            .a
            .checked_add(params.b)
            .ok_or_else(|| McpError::invalid_params("integer overflow", None))?;
        Ok(CallToolResult::success(vec![Content::text(sum.to_string())]))
    }
}

impl Default for DemoToolsServer {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_handler]
impl rmcp::ServerHandler for DemoToolsServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Demo tools for the MCP registry".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr
    mcp_registry::logging::init_tracing("demo_tools=info")?;

    tracing::info!("Starting demo-tools MCP server");

    let service = DemoToolsServer::new()
        .serve(rmcp::transport::stdio())
        .await?;
    service.waiting().await?;

    tracing::info!("demo-tools shutting down");
    Ok(())
}
