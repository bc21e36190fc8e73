//! HTTP server for the registry management API
//!
//! All management routes live under `/mcp`; `/health` reports on the
//! registry itself.

pub mod api;
pub mod state;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::catalog::ServerCatalog;
use crate::config::RegistryConfig;
use crate::db::Database;
use state::AppState;

/// Start the HTTP server and run until Ctrl-C
///
/// Supervised processes are terminated before returning.
pub async fn serve(config: RegistryConfig) -> Result<()> {
    let db = match &config.database.path {
        Some(path) => Database::open_at(path.clone())?,
        None => Database::open()?,
    };

    let catalog = ServerCatalog::new(db, &config)?;

    let restored = catalog.recover(config.supervisor.restore_on_boot).await?;
    if !restored.is_empty() {
        tracing::info!("Restored MCP servers: {}", restored.join(", "));
    }

    let app = create_router(AppState::new(catalog.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Starting registry on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("Shutting down MCP servers");
    catalog.shutdown().await;

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create the router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mcp_routes = Router::new()
        // Listing and aggregates
        .route("/servers", post(api::list_servers))
        .route("/statistics", get(api::statistics))
        // Registration
        .route("/servers/create", post(api::create_server))
        .route("/servers/check/{id}", get(api::check_server_id))
        // Single server
        .route(
            "/servers/{id}",
            get(api::get_server)
                .put(api::update_server)
                .delete(api::delete_server),
        )
        // Lifecycle
        .route("/servers/{id}/start", post(api::start_server))
        .route("/servers/{id}/stop", post(api::stop_server))
        // Tools
        .route("/servers/{id}/tools", get(api::list_server_tools))
        .route("/servers/{id}/tools/{tool}", post(api::call_server_tool));

    Router::new()
        .nest("/mcp", mcp_routes)
        .route("/health", get(api::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
