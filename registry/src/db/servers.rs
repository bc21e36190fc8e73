//! MCP server record CRUD operations

use super::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SERVER_COLUMNS: &str = "id, description, command, args, connection_type, url, env, \
                              status, error_message, created_at, last_used_at";

/// How the registry talks MCP to a server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Stdio,
    Sse,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Stdio => "stdio",
            ConnectionType::Sse => "sse",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConnectionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(ConnectionType::Stdio),
            "sse" => Ok(ConnectionType::Sse),
            _ => Err(anyhow::anyhow!("Unknown connection type: {}", s)),
        }
    }
}

/// Lifecycle status of a server record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(ServerStatus::Running),
            "stopped" => Ok(ServerStatus::Stopped),
            "error" => Ok(ServerStatus::Error),
            _ => Err(anyhow::anyhow!("Unknown server status: {}", s)),
        }
    }
}

/// Persisted MCP server record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub description: String,
    pub command: String,
    pub args: String,
    pub connection_type: ConnectionType,
    /// Event-stream endpoint exposed by the process (sse only)
    pub url: Option<String>,
    pub env: BTreeMap<String, String>,
    pub status: ServerStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Parameters for registering a new server
#[derive(Debug, Clone)]
pub struct NewServer {
    pub id: String,
    pub description: String,
    pub command: String,
    pub args: String,
    pub connection_type: ConnectionType,
    pub url: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Parameters for updating a server; `None` leaves the field unchanged
#[derive(Debug, Clone, Default)]
pub struct ServerChanges {
    pub description: Option<String>,
    pub command: Option<String>,
    pub args: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub url: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
}

/// Filters for listing servers
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub connection_type: Option<ConnectionType>,
    pub status: Option<ServerStatus>,
    /// Case-insensitive substring match over id and description
    pub query: Option<String>,
}

/// Aggregate counts over all server records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStatistics {
    pub total: u64,
    pub stdio: u64,
    pub sse: u64,
    pub running: u64,
    pub stopped: u64,
}

/// Result of an update attempt
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(ServerRecord),
    NotFound,
    /// Rejected because the server is running
    Running,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQLite matches chronological order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let connection_type: String = row.get(4)?;
    let env: String = row.get(6)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let last_used_at: Option<String> = row.get(10)?;

    Ok(ServerRecord {
        id: row.get(0)?,
        description: row.get(1)?,
        command: row.get(2)?,
        args: row.get(3)?,
        connection_type: connection_type
            .parse()
            .map_err(|e: anyhow::Error| conversion_error(4, e))?,
        url: row.get(5)?,
        env: serde_json::from_str(&env).map_err(|e| conversion_error(6, e))?,
        status: status
            .parse()
            .map_err(|e: anyhow::Error| conversion_error(7, e))?,
        error_message: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
        last_used_at: last_used_at
            .map(|s| parse_timestamp(10, &s))
            .transpose()?,
    })
}

fn fetch_server(conn: &Connection, id: &str) -> Result<Option<ServerRecord>> {
    let sql = format!("SELECT {} FROM mcp_servers WHERE id = ?1", SERVER_COLUMNS);
    let record = conn
        .query_row(&sql, [id], row_to_server)
        .optional()
        .with_context(|| format!("Failed to load server '{}'", id))?;
    Ok(record)
}

/// Escape LIKE wildcards so the query matches literally
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

impl Database {
    /// Register a new server in `stopped` status
    ///
    /// Returns `None` if a server with the same id already exists.
    pub fn create_server(&self, params: NewServer) -> Result<Option<ServerRecord>> {
        let now = format_timestamp(&Utc::now());
        let env_json = serde_json::to_string(&params.env)?;

        let conn = self.conn()?;
        let rows = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO mcp_servers
                    (id, description, command, args, connection_type, url, env, status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'stopped', ?8)
                "#,
                (
                    &params.id,
                    &params.description,
                    &params.command,
                    &params.args,
                    params.connection_type.as_str(),
                    &params.url,
                    &env_json,
                    &now,
                ),
            )
            .context("Failed to create server")?;

        if rows == 0 {
            return Ok(None);
        }
        fetch_server(&conn, &params.id)
    }

    /// Get a server by id
    pub fn get_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        let conn = self.conn()?;
        fetch_server(&conn, id)
    }

    /// Check whether a server with the given id exists
    pub fn server_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM mcp_servers WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Update the configuration of a server that is not running
    ///
    /// Status and timestamps are never touched here.
    pub fn update_server(&self, id: &str, changes: ServerChanges) -> Result<UpdateOutcome> {
        let env_json = changes
            .env
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        let rows = conn
            .execute(
                r#"
                UPDATE mcp_servers SET
                    description = COALESCE(?1, description),
                    command = COALESCE(?2, command),
                    args = COALESCE(?3, args),
                    connection_type = COALESCE(?4, connection_type),
                    url = COALESCE(?5, url),
                    env = COALESCE(?6, env)
                WHERE id = ?7 AND status != 'running'
                "#,
                (
                    &changes.description,
                    &changes.command,
                    &changes.args,
                    changes.connection_type.map(|c| c.as_str()),
                    &changes.url,
                    &env_json,
                    id,
                ),
            )
            .with_context(|| format!("Failed to update server '{}'", id))?;

        match fetch_server(&conn, id)? {
            None => Ok(UpdateOutcome::NotFound),
            Some(_) if rows == 0 => Ok(UpdateOutcome::Running),
            Some(record) => Ok(UpdateOutcome::Updated(record)),
        }
    }

    /// Delete a server record
    pub fn delete_server(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM mcp_servers WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    /// List servers matching the filter, ordered by creation time
    ///
    /// Returns the requested page and the total number of matching records.
    pub fn list_servers(
        &self,
        filter: &ServerFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<ServerRecord>, u64)> {
        let mut where_sql = String::from(" WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(connection_type) = filter.connection_type {
            where_sql.push_str(" AND connection_type = ?");
            params.push(Box::new(connection_type.as_str()));
        }
        if let Some(status) = filter.status {
            where_sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str()));
        }
        if let Some(query) = filter.query.as_deref().filter(|q| !q.is_empty()) {
            where_sql.push_str(" AND (id LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\')");
            let pattern = like_pattern(query);
            params.push(Box::new(pattern.clone()));
            params.push(Box::new(pattern));
        }

        let conn = self.conn()?;

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM mcp_servers{}", where_sql),
            params_refs.as_slice(),
            |row| row.get(0),
        )?;

        params.push(Box::new(limit));
        params.push(Box::new(offset));
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let sql = format!(
            "SELECT {} FROM mcp_servers{} ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            SERVER_COLUMNS, where_sql
        );
        let mut stmt = conn.prepare(&sql)?;
        let servers = stmt
            .query_map(params_refs.as_slice(), row_to_server)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((servers, total.max(0) as u64))
    }

    /// Compute aggregate counts by scanning all records
    pub fn server_statistics(&self) -> Result<ServerStatistics> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(connection_type = 'stdio'), 0),
                COALESCE(SUM(connection_type = 'sse'), 0),
                COALESCE(SUM(status = 'running'), 0),
                COALESCE(SUM(status = 'stopped'), 0)
            FROM mcp_servers
            "#,
            [],
            |row| {
                let count = |idx: usize| -> rusqlite::Result<u64> {
                    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
                };
                Ok(ServerStatistics {
                    total: count(0)?,
                    stdio: count(1)?,
                    sse: count(2)?,
                    running: count(3)?,
                    stopped: count(4)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Record a status transition (supervisor only)
    pub fn set_server_status(
        &self,
        id: &str,
        status: ServerStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE mcp_servers SET status = ?1, error_message = ?2 WHERE id = ?3",
            (status.as_str(), error_message, id),
        )?;
        Ok(rows > 0)
    }

    /// Mark a server as used now
    pub fn touch_server(&self, id: &str) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mcp_servers SET last_used_at = ?1 WHERE id = ?2",
            (&now, id),
        )?;
        Ok(())
    }

    /// Mark every `running` record as `stopped`
    ///
    /// Used at boot: processes from a previous registry instance died with it.
    /// Returns the ids that were reset.
    pub fn reset_running_servers(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let ids = conn
            .prepare("SELECT id FROM mcp_servers WHERE status = 'running' ORDER BY created_at, id")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        conn.execute(
            "UPDATE mcp_servers SET status = 'stopped', error_message = NULL WHERE status = 'running'",
            [],
        )?;
        Ok(ids)
    }
}
