//! Configuration loading

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file
pub const CONFIG_FILE: &str = ".registry.toml";

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/mcp-registry/
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("mcp-registry").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

/// Top-level registry configuration (from .registry.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

/// HTTP server section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSection {
    /// Database file; defaults to ~/.mcp-registry/registry.db
    pub path: Option<PathBuf>,
}

/// Process supervision section
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    /// Upper bound for spawning a stdio server and completing the MCP handshake
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// How long an sse server must survive after spawn to count as started
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping a server
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Restart servers that were running when the registry last exited
    #[serde(default)]
    pub restore_on_boot: bool,
}

/// Tool discovery section
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_discovery_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_startup_probe_ms() -> u64 {
    500
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_discovery_timeout_secs() -> u64 {
    30
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout_secs(),
            startup_probe_ms: default_startup_probe_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            restore_on_boot: false,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            timeout_secs: default_discovery_timeout_secs(),
        }
    }
}

impl SupervisorSection {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl DiscoverySection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RegistryConfig {
    /// Load config from .registry.toml
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .registry.toml
    /// 2. Check ~/.config/mcp-registry/.registry.toml (global fallback)
    /// 3. Fall back to defaults
    pub fn load() -> Result<Self> {
        if let Some(config_path) = find_config_file(CONFIG_FILE) {
            tracing::debug!("Loading config from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No {} found, using defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: RegistryConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }
}
