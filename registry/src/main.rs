use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use mcp_registry::config::RegistryConfig;
use mcp_registry::db::{Database, ServerFilter};
use mcp_registry::{logging, web};

#[derive(Parser)]
#[command(name = "mcp-registry")]
#[command(about = "Register, supervise and inspect MCP tool servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the nearest .registry.toml)
    #[arg(long, global = true, env = "MCP_REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Database file
    #[arg(long, global = true, env = "MCP_REGISTRY_DB")]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to bind
        #[arg(long, env = "MCP_REGISTRY_HOST")]
        host: Option<String>,
        /// Port to listen on
        #[arg(long, short, env = "MCP_REGISTRY_PORT")]
        port: Option<u16>,
    },
    /// Print registered servers
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing("mcp_registry=info,tower_http=info")?;

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RegistryConfig::load_from_path(path)?,
        None => RegistryConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.database.path = Some(db);
    }

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            web::serve(config).await?;
        }
        Commands::List => {
            // Read-only: a running `serve` owns the process state
            let db = match &config.database.path {
                Some(path) => Database::open_at(path.clone())?,
                None => Database::open()?,
            };
            let (servers, total) = db.list_servers(&ServerFilter::default(), u32::MAX, 0)?;
            if total == 0 {
                println!("No servers registered");
            }
            for server in servers {
                println!(
                    "{:<24} {:<6} {:<8} {} {}",
                    server.id,
                    server.connection_type.as_str(),
                    server.status.as_str(),
                    server.command,
                    server.args
                );
            }
        }
    }

    Ok(())
}
