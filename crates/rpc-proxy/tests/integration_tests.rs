//! Integration tests for the RPC proxy server

use neurai_rpc_proxy::{config::ProxyConfig, proxy::ProxyServer, ProxyServerBuilder};
use reqwest::Client;
use serde_json::{json, Value};
use std::{net::SocketAddr, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;
use wiremock::{
    matchers::{body_partial_json, body_string_contains, method},
    Mock, MockServer, ResponseTemplate,
};

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"result": result, "error": null, "id": 1}))
}

/// Mount a `getbestblockhash` answer so the node passes health checks
async fn healthy_node(tip: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getbestblockhash"})))
        .respond_with(rpc_result(json!(tip)))
        .mount(&server)
        .await;
    server
}

fn node_config(name: &str, url: &str) -> Value {
    json!({
        "name": name,
        "username": "user",
        "password": "pass",
        "neurai_url": url,
    })
}

/// Build a proxy over `nodes`, serving static files from a scratch directory
fn create_test_proxy(nodes: Vec<Value>) -> (ProxyServer, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = json!({
        "concurrency": 2,
        "environment": "Neurai Testnet",
        "nodes": nodes,
    });
    let config = ProxyConfig::from_json(&config.to_string()).unwrap();

    let proxy = ProxyServerBuilder::new(config)
        .health_check_interval(Duration::from_secs(60))
        .request_timeout(Duration::from_secs(5))
        .static_dir(temp_dir.path())
        .build()
        .unwrap();

    (proxy, temp_dir)
}

/// Start proxy server on a random port and return the address
async fn start_proxy_server(proxy: ProxyServer) -> SocketAddr {
    // Find an available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let actual_addr = listener.local_addr().unwrap();
    drop(listener); // Release the listener so proxy.serve can bind to it

    tokio::spawn(async move {
        proxy.serve(actual_addr).await.unwrap();
    });

    // Give the server and the first health check a moment
    sleep(Duration::from_millis(300)).await;
    actual_addr
}

#[tokio::test]
async fn test_identical_calls_share_one_upstream_request() {
    let node = healthy_node("00000000a1").await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getassetdata", "params": ["GOLD"]})))
        .respond_with(
            rpc_result(json!({"name": "GOLD", "amount": 21000000, "units": 8}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&node)
        .await;

    let (proxy, _temp_dir) = create_test_proxy(vec![node_config("node-1", &node.uri())]);
    let proxy_addr = start_proxy_server(proxy).await;

    let client = Client::new();
    let proxy_url = format!("http://{proxy_addr}/rpc");
    let request = json!({"method": "getassetdata", "params": ["GOLD"]});

    let responses = futures::future::join_all(
        (0..5).map(|_| client.post(&proxy_url).json(&request).send()),
    )
    .await;
    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["result"]["name"], "GOLD");
    }

    // Served from the cache, still one upstream request
    let response = client.post(&proxy_url).json(&request).send().await.unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["amount"], 21000000);

    let stats: Value = client
        .get(format!("http://{proxy_addr}/getCache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["number_of_items_in_cache"], 1);
    assert_eq!(stats["number_of_requests"], 6);
    assert_eq!(stats["last_best_block_hash"], "00000000a1");
    assert_eq!(stats["metrics"]["cache_misses"], 1);
    assert_eq!(stats["methods"]["getassetdata"]["calls"], 6);
}

#[tokio::test]
async fn test_failover_to_healthy_node() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getbestblockhash"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "result": null,
            "error": {"code": -28, "message": "Loading block index..."},
            "id": 1
        })))
        .mount(&broken)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getblockcount"})))
        .respond_with(rpc_result(json!(1)))
        .expect(0)
        .mount(&broken)
        .await;

    let healthy = healthy_node("00000000b2").await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getblockcount"})))
        .respond_with(rpc_result(json!(424242)))
        .expect(1)
        .mount(&healthy)
        .await;

    let (proxy, _temp_dir) = create_test_proxy(vec![
        node_config("node-1", &broken.uri()),
        node_config("node-2", &healthy.uri()),
    ]);
    let proxy_addr = start_proxy_server(proxy).await;

    let client = Client::new();
    let response = client
        .post(format!("http://{proxy_addr}/rpc"))
        .json(&json!({"method": "getblockcount", "params": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"], 424242);

    let stats: Value = client
        .get(format!("http://{proxy_addr}/getCache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["nodes"][0]["active"], false);
    assert_eq!(stats["nodes"][1]["active"], true);
}

#[tokio::test]
async fn test_upstream_error_forwarded() {
    let node = healthy_node("00000000c3").await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getrawtransaction"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "result": null,
            "error": {"code": -5, "message": "No such mempool or blockchain transaction"},
            "id": 1
        })))
        .mount(&node)
        .await;

    let (proxy, _temp_dir) = create_test_proxy(vec![node_config("node-1", &node.uri())]);
    let proxy_addr = start_proxy_server(proxy).await;

    let response = Client::new()
        .post(format!("http://{proxy_addr}/rpc"))
        .json(&json!({"method": "getrawtransaction", "params": ["ab"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -5);
    assert_eq!(body["node"], "node-1");
}

#[tokio::test]
async fn test_request_rejections() {
    let node = healthy_node("00000000d4").await;
    let (proxy, _temp_dir) = create_test_proxy(vec![node_config("node-1", &node.uri())]);
    let proxy_addr = start_proxy_server(proxy).await;

    let client = Client::new();

    let response = client
        .post(format!("http://{proxy_addr}/rpc"))
        .json(&json!({"method": "dumpprivkey", "params": ["NX"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Not in whitelist");

    let response = client.get(format!("http://{proxy_addr}/rpc")).send().await.unwrap();
    assert_eq!(response.status(), 405);
    assert_eq!(response.headers()["allow"], "POST");

    let response = client
        .post(format!("http://{proxy_addr}/depin"))
        .json(&json!({"address": "NX", "method": "getblockcount", "params": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Missing or invalid signature");
}

#[tokio::test]
async fn test_depin_call_through_proxy() {
    let node = healthy_node("00000000e5").await;
    let depin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("PING"))
        .respond_with(ResponseTemplate::new(200).set_body_string("PONG\n"))
        .mount(&depin)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("AUTH NXdepinAddress"))
        .respond_with(ResponseTemplate::new(200).set_body_string("CHALLENGE 0a1b2c 60\n"))
        .expect(1)
        .mount(&depin)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "address": "NXdepinAddress",
            "signature": "H0lG3Hf+sig==",
            "request": {"method": "getblockcount", "params": []}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 777, "error": null})))
        .expect(2)
        .mount(&depin)
        .await;

    let mut node = node_config("node-1", &node.uri());
    node["depin_enabled"] = json!(true);
    node["depin_url"] = json!(depin.uri());
    let (proxy, _temp_dir) = create_test_proxy(vec![node]);
    let proxy_addr = start_proxy_server(proxy).await;

    let client = Client::new();
    let request = json!({
        "address": "NXdepinAddress",
        "signature": "H0lG3Hf+sig==",
        "method": "getblockcount",
        "params": []
    });

    // The second call reuses the cached challenge
    for _ in 0..2 {
        let response =
            client.post(format!("http://{proxy_addr}/depin")).json(&request).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["result"], 777);
    }

    let stats: Value = client
        .get(format!("http://{proxy_addr}/getCache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["depin_challenges"]["total_challenges"], 1);
    assert_eq!(stats["depin_nodes"][0]["active"], true);
}

#[tokio::test]
async fn test_public_endpoints() {
    let node = healthy_node("00000000f6").await;
    let (proxy, temp_dir) = create_test_proxy(vec![node_config("node-1", &node.uri())]);
    std::fs::write(temp_dir.path().join("index.html"), "<title>Neurai RPC</title>").unwrap();
    let proxy_addr = start_proxy_server(proxy).await;

    let client = Client::new();

    let settings: Value =
        client.get(format!("http://{proxy_addr}/settings")).send().await.unwrap().json().await.unwrap();
    assert_eq!(settings["environment"], "Neurai Testnet");

    let whitelist: Value =
        client.get(format!("http://{proxy_addr}/whitelist")).send().await.unwrap().json().await.unwrap();
    assert!(whitelist.as_array().unwrap().contains(&json!("getblockcount")));

    let health: Value =
        client.get(format!("http://{proxy_addr}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["service"], "neurai-rpc-proxy");

    let page =
        client.get(format!("http://{proxy_addr}/index.html")).send().await.unwrap().text().await.unwrap();
    assert_eq!(page, "<title>Neurai RPC</title>");
}

#[tokio::test]
async fn test_config_file_loading() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    std::fs::write(
        &path,
        json!({"local_port": 18999, "nodes": [node_config("node-1", "http://127.0.0.1:19001")]})
            .to_string(),
    )
    .unwrap();

    let config = ProxyConfig::load(&path).unwrap();
    assert_eq!(config.resolve_port(None), 18999);
    assert_eq!(config.resolve_port(Some(8080)), 8080);
    assert_eq!(config.concurrency, 1);

    assert!(ProxyConfig::load(temp_dir.path().join("missing.json")).is_err());
}
