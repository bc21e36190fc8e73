//! Registry for MCP tool servers
//!
//! Persists server records, supervises their processes and discovers the
//! tools they expose, behind a REST API.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod web;

pub use catalog::ServerCatalog;
pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
