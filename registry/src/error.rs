//! Error taxonomy for registry operations
//!
//! Every failure surfaced to a client maps to exactly one variant, and every
//! variant maps to exactly one HTTP status code.

use std::time::Duration;

use axum::http::StatusCode;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No server record with the given id
    #[error("server '{0}' not found")]
    NotFound(String),

    /// A server record with the given id already exists
    #[error("server '{0}' already exists")]
    Conflict(String),

    /// Request failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation requires the server to be stopped
    #[error("server '{0}' is running, stop it before updating")]
    ServerRunning(String),

    /// The operation requires the server to be running
    #[error("server '{0}' is not running")]
    ServerNotRunning(String),

    /// Launching the server process failed
    #[error("failed to start server '{id}': {message}")]
    Start { id: String, message: String },

    /// Terminating the server process failed
    #[error("failed to stop server '{id}': {message}")]
    Stop { id: String, message: String },

    /// The tool list could not be retrieved from a running server
    #[error("tool discovery failed for server '{id}': {message}")]
    Discovery { id: String, message: String },

    /// The tool list was not returned in time
    #[error("tool discovery for server '{id}' timed out after {timeout:?}")]
    DiscoveryTimeout { id: String, timeout: Duration },

    /// A tool invocation failed on the running server
    #[error("tool '{tool}' failed on server '{id}': {message}")]
    ToolCall {
        id: String,
        tool: String,
        message: String,
    },

    /// A tool invocation did not complete in time
    #[error("tool '{tool}' on server '{id}' timed out after {timeout:?}")]
    ToolCallTimeout {
        id: String,
        tool: String,
        timeout: Duration,
    },

    /// Storage or other unexpected failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    pub(crate) fn start(id: &str, message: impl Into<String>) -> Self {
        Self::Start {
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn stop(id: &str, message: impl Into<String>) -> Self {
        Self::Stop {
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn discovery(id: &str, message: impl Into<String>) -> Self {
        Self::Discovery {
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn tool_call(id: &str, tool: &str, message: impl Into<String>) -> Self {
        Self::ToolCall {
            id: id.to_string(),
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::ServerRunning(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) | Self::ServerNotRunning(_) => StatusCode::BAD_REQUEST,
            Self::Start { .. } | Self::Stop { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Discovery { .. } | Self::ToolCall { .. } => StatusCode::BAD_GATEWAY,
            Self::DiscoveryTimeout { .. } | Self::ToolCallTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }
}
