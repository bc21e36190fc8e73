//! MCP server process supervision and tool discovery

pub mod discovery;
pub mod process;
pub mod sse;
pub mod supervisor;
pub mod types;

pub use discovery::{ToolDiscoveryClient, ToolEndpoint};
pub use process::{LaunchSpec, LaunchTimeouts};
pub use supervisor::{ProcessLease, ProcessSupervisor};
pub use types::{ParameterSchema, ToolCallResult, ToolDescriptor};
