//! Tool discovery over the HTTP+SSE transport
//!
//! An in-test axum app plays the MCP server; a `sleep` process stands in for
//! the supervised server process.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, Stream, StreamExt};
use mcp_registry::catalog::{ListRequest, ServerCatalog, ServerInput};
use mcp_registry::config::RegistryConfig;
use mcp_registry::db::{ConnectionType, Database, ServerStatus};
use mcp_registry::RegistryError;
use serde_json::{json, Map, Value};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

type Session = Arc<Mutex<Option<mpsc::UnboundedSender<Event>>>>;

async fn open_stream(
    State(session): State<Session>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    *session.lock().unwrap() = Some(tx);

    let endpoint = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("endpoint").data("/message?session=1"))
    });
    let messages = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Sse::new(endpoint.chain(messages))
}

fn tool_page(cursor: Option<&str>) -> Value {
    match cursor {
        None => json!({
            "tools": [{
                "name": "search",
                "description": "Search documents",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search terms" },
                        "limit": { "type": ["integer", "null"] }
                    }
                }
            }],
            "nextCursor": "page-2"
        }),
        Some(_) => json!({
            "tools": [{ "name": "fetch", "inputSchema": { "type": "object" } }]
        }),
    }
}

fn call_result(params: &Value) -> Result<Value, String> {
    match params["name"].as_str() {
        Some("search") => {
            let query = params["arguments"]["query"].as_str().unwrap_or_default();
            Ok(json!({
                "content": [{ "type": "text", "text": format!("3 results for {}", query) }],
                "isError": false
            }))
        }
        other => Err(format!("unknown tool: {:?}", other)),
    }
}

async fn handle_message(State(session): State<Session>, Json(message): Json<Value>) -> StatusCode {
    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };

    let result = match message["method"].as_str() {
        Some("initialize") => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "test-sse", "version": "0.0.1" }
        })),
        Some("tools/list") => Ok(tool_page(message["params"]["cursor"].as_str())),
        Some("tools/call") => call_result(&message["params"]),
        _ => return StatusCode::BAD_REQUEST,
    };

    let response = match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32602, "message": error }
        }),
    };
    if let Some(tx) = session.lock().unwrap().as_ref() {
        let _ = tx.send(Event::default().event("message").data(response.to_string()));
    }
    StatusCode::ACCEPTED
}

/// Accepts the stream but never says anything
async fn silent_stream() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(stream::pending::<Result<Event, Infallible>>())
}

async fn spawn_sse_server() -> String {
    let session: Session = Arc::default();
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/message", post(handle_message))
        .route("/silent", get(silent_stream))
        .with_state(session);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn test_catalog() -> (ServerCatalog, TempDir) {
    let dir = tempdir().unwrap();
    let db = Database::open_at(dir.path().join("registry.db")).unwrap();

    let mut config = RegistryConfig::default();
    config.supervisor.startup_probe_ms = 100;
    config.discovery.timeout_secs = 1;

    let catalog = ServerCatalog::new(db, &config).unwrap();
    (catalog, dir)
}

fn sse_server(id: &str, url: String) -> ServerInput {
    ServerInput {
        id: id.to_string(),
        description: String::new(),
        command: "sleep".to_string(),
        args: "30".to_string(),
        connection_type: ConnectionType::Sse,
        url: Some(url),
        env: BTreeMap::new(),
    }
}

#[tokio::test]
async fn discovers_tools_across_pages() {
    let base = spawn_sse_server().await;
    let (catalog, _dir) = test_catalog();

    catalog
        .create(sse_server("docs", format!("{}/sse", base)))
        .await
        .unwrap();
    catalog.start("docs").await.unwrap();

    let tools = catalog.list_tools("docs").await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["search", "fetch"]);

    let search = &tools[0];
    assert_eq!(search.description, "Search documents");
    assert_eq!(search.parameters["query"].param_type, "string");
    assert_eq!(search.parameters["query"].description, "Search terms");
    assert_eq!(search.parameters["limit"].param_type, "integer");
    assert!(tools[1].parameters.is_empty());

    let record = catalog.get("docs").await.unwrap();
    assert!(record.last_used_at.is_some());

    catalog.stop("docs").await.unwrap();
}

#[tokio::test]
async fn silent_endpoint_times_out_without_changing_status() {
    let base = spawn_sse_server().await;
    let (catalog, _dir) = test_catalog();

    catalog
        .create(sse_server("quiet", format!("{}/silent", base)))
        .await
        .unwrap();
    catalog.start("quiet").await.unwrap();

    let err = catalog.list_tools("quiet").await.unwrap_err();
    assert!(matches!(err, RegistryError::DiscoveryTimeout { .. }), "{}", err);
    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);

    let record = catalog.get("quiet").await.unwrap();
    assert_eq!(record.status, ServerStatus::Running);
    assert!(record.last_used_at.is_none());

    catalog.stop("quiet").await.unwrap();
}

#[tokio::test]
async fn unreachable_endpoint_is_discovery_error() {
    let (catalog, _dir) = test_catalog();

    // Nothing listens on the discard port
    catalog
        .create(sse_server("gone", "http://127.0.0.1:9/sse".to_string()))
        .await
        .unwrap();
    catalog.start("gone").await.unwrap();

    let err = catalog.list_tools("gone").await.unwrap_err();
    assert!(matches!(err, RegistryError::Discovery { .. }), "{}", err);
    assert_eq!(
        catalog.get("gone").await.unwrap().status,
        ServerStatus::Running
    );

    catalog.stop("gone").await.unwrap();
}

#[tokio::test]
async fn calls_tool_over_sse() {
    let base = spawn_sse_server().await;
    let (catalog, _dir) = test_catalog();

    catalog
        .create(sse_server("docs", format!("{}/sse", base)))
        .await
        .unwrap();
    catalog.start("docs").await.unwrap();

    let mut arguments = Map::new();
    arguments.insert("query".to_string(), json!("rust"));
    let result = catalog.call_tool("docs", "search", arguments).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0]["text"], "3 results for rust");
    assert!(catalog.get("docs").await.unwrap().last_used_at.is_some());

    let err = catalog
        .call_tool("docs", "delete_everything", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ToolCall { .. }), "{}", err);
    assert!(err.to_string().contains("unknown tool"), "{}", err);

    catalog.stop("docs").await.unwrap();
}

#[tokio::test]
async fn reads_do_not_wait_for_pending_discovery() {
    let base = spawn_sse_server().await;
    let (catalog, _dir) = test_catalog();

    catalog
        .create(sse_server("quiet", format!("{}/silent", base)))
        .await
        .unwrap();
    catalog.start("quiet").await.unwrap();

    let pending = {
        let catalog = catalog.clone();
        tokio::spawn(async move { catalog.list_tools("quiet").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let stats = catalog.statistics().await.unwrap();
    let page = catalog.list(ListRequest::default()).await.unwrap();
    let record = catalog.get("quiet").await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(500), "reads took {:?}", elapsed);
    assert_eq!(stats.running, 1);
    assert_eq!(page.items[0].status, ServerStatus::Running);
    assert_eq!(record.status, ServerStatus::Running);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, RegistryError::DiscoveryTimeout { .. }), "{}", err);
    catalog.stop("quiet").await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_pending_discovery() {
    let base = spawn_sse_server().await;
    let (catalog, _dir) = test_catalog();

    catalog
        .create(sse_server("quiet", format!("{}/silent", base)))
        .await
        .unwrap();
    catalog.start("quiet").await.unwrap();

    let pending = {
        let catalog = catalog.clone();
        tokio::spawn(async move { catalog.list_tools("quiet").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Discovery holds the process until its 1s timeout
    let started = Instant::now();
    let record = catalog.stop("quiet").await.unwrap();
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(600), "stop returned after {:?}", waited);
    assert_eq!(record.status, ServerStatus::Stopped);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, RegistryError::DiscoveryTimeout { .. }), "{}", err);
    assert_eq!(
        catalog.get("quiet").await.unwrap().status,
        ServerStatus::Stopped
    );
}
