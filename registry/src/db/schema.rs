//! Database schema definitions and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Create all tables if they don't exist
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- MCP server records
        CREATE TABLE IF NOT EXISTS mcp_servers (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            command TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '',
            connection_type TEXT NOT NULL CHECK (connection_type IN ('stdio', 'sse')),
            url TEXT,
            env TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'stopped'
                CHECK (status IN ('running', 'stopped', 'error')),
            error_message TEXT,
            created_at TEXT NOT NULL,
            last_used_at TEXT
        );

        -- Listing order for pagination
        CREATE INDEX IF NOT EXISTS idx_mcp_servers_created
        ON mcp_servers(created_at, id);

        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
