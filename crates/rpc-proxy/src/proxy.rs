// Neurai RPC Proxy
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP server and background task wiring

use crate::{
    challenge::DEFAULT_SWEEP_INTERVAL,
    config::ProxyConfig,
    errors::RequestError,
    freshness::PROBE_RESET_INTERVAL,
    health::PublicSettings,
    providers::{NodePool, DEFAULT_HEALTH_CHECK_INTERVAL},
    rpc::{DePinRequest, RpcHandler, RpcRequest},
    transport::DEFAULT_REQUEST_TIMEOUT,
    whitelist::Whitelist,
};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Directory served for non-API paths when none is configured
pub const DEFAULT_STATIC_DIR: &str = "www";

/// Builder for configuring ProxyServer from a loaded configuration
#[derive(Debug, Clone)]
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    health_check_interval: Duration,
    request_timeout: Duration,
    static_dir: Option<PathBuf>,
}

impl ProxyServerBuilder {
    /// Create a builder with default intervals
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            static_dir: None,
        }
    }

    /// Set the node health check interval
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the timeout of every upstream HTTP request
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Serve static files from `dir`, overriding the configured directory
    pub fn static_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    /// Build the server and start its background tasks
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<ProxyServer> {
        let Self { config, health_check_interval, request_timeout, static_dir } = self;

        info!("Starting Neurai RPC Proxy with {} nodes", config.nodes.len());
        let pool = Arc::new(NodePool::from_config(&config.nodes, request_timeout)?);
        let whitelist = Whitelist::from_config(config.whitelist.clone());
        let rpc_handler = Arc::new(RpcHandler::new(
            pool,
            config.concurrency,
            whitelist,
            PublicSettings::from(&config),
        ));

        let static_dir = static_dir
            .or_else(|| config.static_dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR));

        let server = ProxyServer::new(rpc_handler, static_dir);
        server.start_background_tasks(health_check_interval);
        Ok(server)
    }
}

/// The proxy: request handler, HTTP routes and background maintenance
///
/// ```no_run
/// # use neurai_rpc_proxy::{config::ProxyConfig, proxy::ProxyServerBuilder};
/// # async fn example() -> eyre::Result<()> {
/// let config = ProxyConfig::load("config.json")?;
/// let proxy = ProxyServerBuilder::new(config).build()?;
/// proxy.serve("127.0.0.1:19999".parse()?).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProxyServer {
    /// Request handler shared by every route
    pub rpc_handler: Arc<RpcHandler>,
    static_dir: PathBuf,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

#[derive(Clone)]
struct AppState {
    proxy: ProxyServer,
}

impl ProxyServer {
    /// Wrap an existing handler without starting any background task
    pub fn new(rpc_handler: Arc<RpcHandler>, static_dir: PathBuf) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { rpc_handler, static_dir, background: Arc::default(), shutdown_tx }
    }

    /// Spawn node health checks, the probe reset window and the challenge sweeper
    pub fn start_background_tasks(&self, health_check_interval: Duration) {
        let handler = &self.rpc_handler;
        let tasks = [
            handler.pool().start_health_checks(health_check_interval),
            handler.gate().start_probe_reset(PROBE_RESET_INTERVAL),
            handler.challenges().start_sweeper(DEFAULT_SWEEP_INTERVAL),
        ];
        self.background.lock().extend(tasks);
        debug!("Background tasks started (health checks every {:?})", health_check_interval);
    }

    /// Stop the background tasks and ask a running `serve` to exit
    pub fn shutdown(&self) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Routes of the public HTTP surface
    pub fn router(&self) -> Router {
        Router::new()
            .route("/rpc", post(handle_rpc).get(rpc_method_not_allowed))
            .route("/depin", post(handle_depin))
            .route("/getCache", get(handle_get_cache))
            .route("/settings", get(handle_settings))
            .route("/whitelist", get(handle_whitelist))
            .route("/health", get(handle_health))
            .route("/info", get(handle_info))
            .fallback_service(ServeDir::new(&self.static_dir))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { proxy: self.clone() })
    }

    /// Serve on `addr` until [`ProxyServer::shutdown`] is called
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = self.router();

        let listener = TcpListener::bind(addr).await?;
        info!("Neurai RPC Proxy listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, stopping server gracefully");
            })
            .await?;

        Ok(())
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_body())).into_response()
    }
}

fn parse_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, RequestError> {
    body.map(|Json(value)| value).map_err(|rejection| RequestError::InvalidRequest {
        error: "Invalid JSON body".to_string(),
        description: rejection.body_text(),
    })
}

async fn handle_rpc(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, RequestError> {
    let request = RpcRequest::from_value(&parse_body(body)?)?;
    debug!("RPC request: {} {:?}", request.method, request.params);

    let method = request.method.clone();
    match state.proxy.rpc_handler.handle_call(request).await {
        Ok(result) => Ok(Json(json!({ "result": result }))),
        Err(e) => {
            warn!("RPC {} failed: {}", method, e);
            Err(e)
        }
    }
}

async fn rpc_method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(json!({
            "error": "Method not allowed",
            "description": "Send a POST request with a JSON body {\"method\": ..., \"params\": [...]}",
        })),
    )
}

async fn handle_depin(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, RequestError> {
    let request = DePinRequest::from_value(&parse_body(body)?)?;
    let result = state.proxy.rpc_handler.handle_depin(request).await?;
    Ok(Json(json!({ "result": result })))
}

async fn handle_get_cache(State(state): State<AppState>) -> Json<Value> {
    Json(state.proxy.rpc_handler.cache_report())
}

async fn handle_settings(State(state): State<AppState>) -> Json<PublicSettings> {
    Json(state.proxy.rpc_handler.health().settings().clone())
}

async fn handle_whitelist(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.proxy.rpc_handler.whitelist().methods().to_vec())
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(state.proxy.rpc_handler.health().ping())
}

async fn handle_info(State(state): State<AppState>) -> Json<Value> {
    Json(state.proxy.rpc_handler.health().info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        providers::{DePinEndpoint, Endpoint},
        test_utils::{MockDePinTransport, MockTransport},
    };
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_server(static_dir: PathBuf) -> (ProxyServer, Arc<MockTransport>) {
        let node = MockTransport::new("node-1");
        node.respond("getbestblockhash", Ok(json!("tip-1")));
        let pool = NodePool::new(
            vec![Endpoint::new("node-1", "http://node-1", node.clone())],
            vec![DePinEndpoint::new("depin-1", "http://depin:19002")],
            Arc::new(MockDePinTransport::default()),
        )
        .unwrap();

        let settings = PublicSettings {
            heading: Some("Neurai".to_string()),
            environment: Some("Testnet".to_string()),
            endpoint: None,
        };
        let handler = RpcHandler::new(Arc::new(pool), 2, Whitelist::default(), settings);
        (ProxyServer::new(Arc::new(handler), static_dir), node)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Response) {
        let response = router.oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_rpc_route() {
        let (server, node) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));
        node.respond("getblockcount", Ok(json!(1234)));

        let (status, response) =
            send(server.router(), post_json("/rpc", json!({"method": "getblockcount"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"result": 1234}));
    }

    #[tokio::test]
    async fn test_rpc_route_errors() {
        let (server, node) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));
        node.respond(
            "getblock",
            Err(crate::errors::ProxyError::Rpc {
                node: "node-1".to_string(),
                error: json!({"code": -5, "message": "Block not found"}),
            }),
        );

        let (status, response) =
            send(server.router(), post_json("/rpc", json!({"method": "stop", "params": []}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Not in whitelist");
        assert_eq!(body["description"], "Method stop is not supported");

        let (status, response) = send(
            server.router(),
            post_json("/rpc", json!({"method": "getblock", "params": ["00ff"]})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"]["message"], "Block not found");

        let (status, _) =
            send(server.router(), post_json("/rpc", json!({"params": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, response) = send(server.router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid JSON body");
    }

    #[tokio::test]
    async fn test_get_rpc_not_allowed() {
        let (server, _) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));

        let (status, response) = send(server.router(), get_request("/rpc")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
        assert_eq!(body_json(response).await["error"], "Method not allowed");
    }

    #[tokio::test]
    async fn test_depin_route_validation() {
        let (server, node) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));

        let (status, response) = send(
            server.router(),
            post_json("/depin", json!({"signature": "c2ln", "method": "getblockcount", "params": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Missing or invalid address");
        assert_eq!(body["description"], "Request must include a valid 'address' field");

        let (status, _) = send(
            server.router(),
            post_json(
                "/depin",
                json!({"address": "NX", "signature": "c2ln", "method": "stop", "params": []}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(node.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_info_routes() {
        let (server, _) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));

        let (status, response) = send(server.router(), get_request("/settings")).await;
        assert_eq!(status, StatusCode::OK);
        let settings = body_json(response).await;
        assert_eq!(settings["heading"], "Neurai");
        assert_eq!(settings["environment"], "Testnet");

        let (_, response) = send(server.router(), get_request("/whitelist")).await;
        let methods = body_json(response).await;
        assert!(methods.as_array().unwrap().contains(&json!("getassetdata")));

        let (_, response) = send(server.router(), get_request("/health")).await;
        assert_eq!(body_json(response).await["status"], "ok");

        let (_, response) = send(server.router(), get_request("/info")).await;
        assert_eq!(body_json(response).await["version"], env!("CARGO_PKG_VERSION"));

        let (status, response) = send(server.router(), get_request("/getCache")).await;
        assert_eq!(status, StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["number_of_items_in_cache"], 0);
        assert_eq!(report["nodes"][0]["name"], "node-1");
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>Neurai</h1>").unwrap();
        let (server, _) = test_server(dir.path().to_path_buf());

        let (status, response) = send(server.router(), get_request("/index.html")).await;
        assert_eq!(status, StatusCode::OK);
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        assert_eq!(&bytes[..], b"<h1>Neurai</h1>");

        let (status, _) = send(server.router(), get_request("/missing.html")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let (server, _) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));
        let huge = "x".repeat(MAX_BODY_BYTES + 1);

        let (status, _) = send(
            server.router(),
            post_json("/rpc", json!({"method": "getblock", "params": [huge]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let (server, _) = test_server(PathBuf::from(DEFAULT_STATIC_DIR));
        server.start_background_tasks(Duration::from_secs(60));
        assert_eq!(server.background.lock().len(), 3);

        server.shutdown();
        assert!(server.background.lock().is_empty());
    }
}
