//! REST API handlers

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::AppState;
use crate::catalog::{ListRequest, ServerInput, ServerPage, DEFAULT_PAGE_SIZE};
use crate::db::{ConnectionType, ServerChanges, ServerFilter, ServerRecord, ServerStatus};
use crate::error::RegistryError;
use crate::mcp::{ToolCallResult, ToolDescriptor};

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Log a failed request and turn it into a response
fn api_error(action: &str, err: RegistryError) -> ApiError {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!("Failed to {}: {}", action, err);
    } else {
        tracing::warn!("Failed to {}: {}", action, err);
    }
    (status, Json(ErrorResponse::new(err.to_string())))
}

/// Generic `{message}` response
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Body of the list request
#[derive(Debug, Deserialize)]
pub struct ListServersRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub connection_type: Option<ConnectionType>,
    pub status: Option<ServerStatus>,
    pub query: Option<String>,
}

/// List servers with filters and pagination
pub async fn list_servers(
    State(state): State<AppState>,
    Json(req): Json<ListServersRequest>,
) -> Result<Json<ServerPage>, ApiError> {
    let request = ListRequest {
        page: req.page,
        page_size: req.page_size,
        filter: ServerFilter {
            connection_type: req.connection_type,
            status: req.status,
            query: req.query.filter(|q| !q.trim().is_empty()),
        },
    };

    state
        .catalog
        .list(request)
        .await
        .map(Json)
        .map_err(|e| api_error("list servers", e))
}

/// Aggregate server counts
#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub total_servers: u64,
    pub stdio_servers: u64,
    pub sse_servers: u64,
    pub running_servers: u64,
    pub stopped_servers: u64,
}

pub async fn statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsResponse>, ApiError> {
    let stats = state
        .catalog
        .statistics()
        .await
        .map_err(|e| api_error("compute statistics", e))?;

    Ok(Json(StatisticsResponse {
        total_servers: stats.total,
        stdio_servers: stats.stdio,
        sse_servers: stats.sse,
        running_servers: stats.running,
        stopped_servers: stats.stopped,
    }))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerRecord>, ApiError> {
    state
        .catalog
        .get(&id)
        .await
        .map(Json)
        .map_err(|e| api_error("get server", e))
}

/// Discover the tools of a running server
pub async fn list_server_tools(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ToolDescriptor>>, ApiError> {
    state
        .catalog
        .list_tools(&id)
        .await
        .map(Json)
        .map_err(|e| api_error("list tools", e))
}

/// Call tool request; a missing `arguments` means no arguments
#[derive(Debug, Deserialize)]
pub struct CallToolRequest {
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Invoke a tool on a running server
pub async fn call_server_tool(
    State(state): State<AppState>,
    Path((id, tool)): Path<(String, String)>,
    Json(req): Json<CallToolRequest>,
) -> Result<Json<ToolCallResult>, ApiError> {
    state
        .catalog
        .call_tool(&id, &tool, req.arguments)
        .await
        .map(Json)
        .map_err(|e| api_error("call tool", e))
}

/// Whether an id is free to register
pub async fn check_server_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<bool>, ApiError> {
    state
        .catalog
        .check_id_available(&id)
        .map(Json)
        .map_err(|e| api_error("check server id", e))
}

/// Create server request
#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: String,
    pub connection_type: ConnectionType,
    pub url: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<CreateServerRequest>,
) -> Result<(StatusCode, Json<ServerRecord>), ApiError> {
    let input = ServerInput {
        id: req.id,
        description: req.description,
        command: req.command,
        args: req.args,
        connection_type: req.connection_type,
        url: req.url,
        env: req.env,
    };

    state
        .catalog
        .create(input)
        .await
        .map(|record| (StatusCode::CREATED, Json(record)))
        .map_err(|e| api_error("create server", e))
}

/// Update server request; omitted fields are left unchanged
#[derive(Debug, Deserialize)]
pub struct UpdateServerRequest {
    pub description: Option<String>,
    pub command: Option<String>,
    pub args: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub url: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
}

pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateServerRequest>,
) -> Result<Json<ServerRecord>, ApiError> {
    let changes = ServerChanges {
        description: req.description,
        command: req.command,
        args: req.args,
        connection_type: req.connection_type,
        url: req.url,
        env: req.env,
    };

    state
        .catalog
        .update(&id, changes)
        .await
        .map(Json)
        .map_err(|e| api_error("update server", e))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .catalog
        .delete(&id)
        .await
        .map_err(|e| api_error("delete server", e))?;

    Ok(Json(MessageResponse {
        message: format!("Server '{}' deleted", id),
    }))
}

pub async fn start_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .catalog
        .start(&id)
        .await
        .map_err(|e| api_error("start server", e))?;

    Ok(Json(MessageResponse {
        message: format!("Server '{}' started", id),
    }))
}

pub async fn stop_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .catalog
        .stop(&id)
        .await
        .map_err(|e| api_error("stop server", e))?;

    Ok(Json(MessageResponse {
        message: format!("Server '{}' stopped", id),
    }))
}
