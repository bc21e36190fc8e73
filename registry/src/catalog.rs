//! Server catalog service
//!
//! The single entry point used by the HTTP layer and the CLI. Composes the
//! record store, the process supervisor and tool discovery.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::RegistryConfig;
use crate::db::{
    ConnectionType, Database, NewServer, ServerChanges, ServerFilter, ServerRecord,
    ServerStatistics, ServerStatus, UpdateOutcome,
};
use crate::error::{RegistryError, RegistryResult};
use crate::mcp::{
    LaunchSpec, LaunchTimeouts, ProcessSupervisor, ToolCallResult, ToolDescriptor,
    ToolDiscoveryClient,
};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("Invalid server id regex"));

/// Ids shadowed by static routes under `/mcp/servers`
const RESERVED_IDS: &[&str] = &["check", "create"];

/// Input for registering a server
#[derive(Debug, Clone)]
pub struct ServerInput {
    pub id: String,
    pub description: String,
    pub command: String,
    pub args: String,
    pub connection_type: ConnectionType,
    pub url: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Filtered, paginated listing request
#[derive(Debug, Clone)]
pub struct ListRequest {
    pub page: u32,
    pub page_size: u32,
    pub filter: ServerFilter,
}

impl Default for ListRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            filter: ServerFilter::default(),
        }
    }
}

/// One page of server records
#[derive(Debug, Clone, Serialize)]
pub struct ServerPage {
    pub items: Vec<ServerRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

/// Catalog façade over the store, supervisor and discovery client
#[derive(Clone)]
pub struct ServerCatalog {
    db: Database,
    supervisor: Arc<ProcessSupervisor>,
    discovery: ToolDiscoveryClient,
}

impl ServerCatalog {
    pub fn new(db: Database, config: &RegistryConfig) -> RegistryResult<Self> {
        let timeouts = LaunchTimeouts::from(&config.supervisor);
        let discovery = ToolDiscoveryClient::new(config.discovery.timeout())?;
        Ok(Self {
            supervisor: Arc::new(ProcessSupervisor::new(db.clone(), timeouts)),
            db,
            discovery,
        })
    }

    fn require(&self, id: &str) -> RegistryResult<ServerRecord> {
        self.db
            .get_server(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Register a new server in the `stopped` state
    pub async fn create(&self, input: ServerInput) -> RegistryResult<ServerRecord> {
        validate_id(&input.id)?;
        LaunchSpec::parse(
            &input.id,
            &input.command,
            &input.args,
            input.connection_type,
            input.url.as_deref(),
            &input.env,
        )
        .map_err(RegistryError::InvalidInput)?;

        let record = self
            .db
            .create_server(NewServer {
                id: input.id.clone(),
                description: input.description,
                command: input.command.trim().to_string(),
                args: input.args,
                connection_type: input.connection_type,
                url: normalize_url(input.url),
                env: input.env,
            })?
            .ok_or_else(|| RegistryError::Conflict(input.id.clone()))?;

        tracing::info!(server = %record.id, "Registered MCP server");
        Ok(record)
    }

    /// Fetch a record, reconciling its status against the process first
    ///
    /// Never waits on work in flight for the id.
    pub async fn get(&self, id: &str) -> RegistryResult<ServerRecord> {
        let record = self.require(id)?;
        if record.status != ServerStatus::Running {
            return Ok(record);
        }
        self.supervisor.try_reconcile(id)?;
        self.require(id)
    }

    /// Bring every idle `running` record in line with its process
    fn reconcile_running(&self) -> RegistryResult<()> {
        let filter = ServerFilter {
            status: Some(ServerStatus::Running),
            ..Default::default()
        };
        let (running, _) = self.db.list_servers(&filter, u32::MAX, 0)?;
        for record in running {
            self.supervisor.try_reconcile(&record.id)?;
        }
        Ok(())
    }

    pub async fn list(&self, request: ListRequest) -> RegistryResult<ServerPage> {
        if request.page == 0 {
            return Err(RegistryError::InvalidInput(
                "page must be at least 1".to_string(),
            ));
        }
        if request.page_size == 0 || request.page_size > MAX_PAGE_SIZE {
            return Err(RegistryError::InvalidInput(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        self.reconcile_running()?;

        let offset = (request.page - 1).saturating_mul(request.page_size);
        let (items, total) = self
            .db
            .list_servers(&request.filter, request.page_size, offset)?;

        Ok(ServerPage {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            total_pages: total.div_ceil(u64::from(request.page_size)),
        })
    }

    pub async fn statistics(&self) -> RegistryResult<ServerStatistics> {
        self.reconcile_running()?;
        Ok(self.db.server_statistics()?)
    }

    /// Apply a partial update; the server must not be running
    pub async fn update(&self, id: &str, changes: ServerChanges) -> RegistryResult<ServerRecord> {
        self.require(id)?;
        // Waits out a start in flight so it cannot race the update
        if self.supervisor.is_running(id).await? {
            return Err(RegistryError::ServerRunning(id.to_string()));
        }
        let current = self.require(id)?;

        let connection_type = changes.connection_type.unwrap_or(current.connection_type);
        let url = changes.url.clone().or(current.url.clone());
        let env = changes.env.clone().unwrap_or(current.env.clone());
        LaunchSpec::parse(
            id,
            changes.command.as_deref().unwrap_or(&current.command),
            changes.args.as_deref().unwrap_or(&current.args),
            connection_type,
            url.as_deref(),
            &env,
        )
        .map_err(RegistryError::InvalidInput)?;

        let changes = ServerChanges {
            command: changes.command.map(|c| c.trim().to_string()),
            url: normalize_url(changes.url),
            ..changes
        };

        match self.db.update_server(id, changes)? {
            UpdateOutcome::Updated(record) => {
                tracing::info!(server = %id, "Updated MCP server");
                Ok(record)
            }
            UpdateOutcome::NotFound => Err(RegistryError::NotFound(id.to_string())),
            UpdateOutcome::Running => Err(RegistryError::ServerRunning(id.to_string())),
        }
    }

    /// Stop the server if needed, then remove its record
    pub async fn delete(&self, id: &str) -> RegistryResult<()> {
        self.supervisor.remove(id).await?;
        tracing::info!(server = %id, "Deleted MCP server");
        Ok(())
    }

    pub async fn start(&self, id: &str) -> RegistryResult<ServerRecord> {
        self.supervisor.start(id).await
    }

    pub async fn stop(&self, id: &str) -> RegistryResult<ServerRecord> {
        self.supervisor.stop(id).await
    }

    /// Discover the tools of a running server
    ///
    /// Runs on its own task: if the caller goes away the query still finishes
    /// or times out, and the process is left alone.
    pub async fn list_tools(&self, id: &str) -> RegistryResult<Vec<ToolDescriptor>> {
        let task = tokio::spawn(self.clone().discover(id.to_string()));
        task.await
            .map_err(|e| RegistryError::Internal(anyhow::anyhow!("Discovery task failed: {}", e)))?
    }

    async fn discover(self, id: String) -> RegistryResult<Vec<ToolDescriptor>> {
        let lease = self.supervisor.lease(&id).await?;
        let endpoint = lease
            .endpoint()
            .ok_or_else(|| RegistryError::ServerNotRunning(id.clone()))?;
        let tools = self.discovery.list_tools(&id, &endpoint).await?;
        drop(lease);

        self.db.touch_server(&id)?;
        Ok(tools)
    }

    /// Invoke a tool on a running server
    ///
    /// Like discovery, runs on its own task under the process lease and
    /// counts as use of the server.
    pub async fn call_tool(
        &self,
        id: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> RegistryResult<ToolCallResult> {
        if tool.trim().is_empty() {
            return Err(RegistryError::InvalidInput(
                "tool name must not be empty".to_string(),
            ));
        }
        let task = tokio::spawn(self.clone().invoke(id.to_string(), tool.to_string(), arguments));
        task.await
            .map_err(|e| RegistryError::Internal(anyhow::anyhow!("Tool call task failed: {}", e)))?
    }

    async fn invoke(
        self,
        id: String,
        tool: String,
        arguments: Map<String, Value>,
    ) -> RegistryResult<ToolCallResult> {
        let lease = self.supervisor.lease(&id).await?;
        let endpoint = lease
            .endpoint()
            .ok_or_else(|| RegistryError::ServerNotRunning(id.clone()))?;
        let result = self
            .discovery
            .call_tool(&id, &endpoint, &tool, arguments)
            .await?;
        drop(lease);

        self.db.touch_server(&id)?;
        Ok(result)
    }

    pub fn check_id_available(&self, id: &str) -> RegistryResult<bool> {
        if RESERVED_IDS.contains(&id) {
            return Ok(false);
        }
        Ok(!self.db.server_exists(id)?)
    }

    /// Reset records left `running` by a previous instance
    ///
    /// With `restart` set, those servers are started again; start failures
    /// are recorded on the records and do not abort the rest.
    pub async fn recover(&self, restart: bool) -> RegistryResult<Vec<String>> {
        let ids = self.db.reset_running_servers()?;
        if ids.is_empty() {
            return Ok(ids);
        }
        tracing::info!(count = ids.len(), "Reset servers left running by a previous instance");

        let mut restored = Vec::new();
        if restart {
            for id in ids {
                match self.supervisor.start(&id).await {
                    Ok(_) => restored.push(id),
                    Err(e) => tracing::warn!(server = %id, "Failed to restore MCP server: {}", e),
                }
            }
        }
        Ok(restored)
    }

    /// Terminate all supervised processes
    pub async fn shutdown(&self) {
        self.supervisor.shutdown_all().await;
    }
}

fn validate_id(id: &str) -> RegistryResult<()> {
    if !ID_REGEX.is_match(id) {
        return Err(RegistryError::InvalidInput(format!(
            "invalid server id '{}': use 1-64 letters, digits, '.', '_' or '-'",
            id
        )));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(RegistryError::InvalidInput(format!(
            "server id '{}' is reserved",
            id
        )));
    }
    Ok(())
}

fn normalize_url(url: Option<String>) -> Option<String> {
    url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty())
}
