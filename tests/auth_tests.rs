//! Auth strategy behavior against local token endpoints.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use otelbridge::config::{AuthConfig, HttpMethod};
use otelbridge::http::{AuthStrategy, HttpClient};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn client() -> HttpClient {
    HttpClient::new(8, false, 1024 * 1024).unwrap()
}

fn oauth_runtime_config(addr: SocketAddr) -> AuthConfig {
    AuthConfig::Oauth {
        token_env: None,
        username_env: None,
        password_env: None,
        get_token_endpoint: Some(format!("http://{}/token", addr)),
        token_key: Some("access_token".to_string()),
        body_data: None,
        get_token_method: HttpMethod::Post,
        token_headers: HashMap::new(),
    }
}

#[tokio::test]
async fn test_concurrent_token_requests_coalesce_to_one_fetch() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let addr = spawn_server(
        Router::new()
            .route(
                "/token",
                post(|State(counter): State<Arc<AtomicUsize>>| async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    // Slow enough that all callers pile up on the latch.
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    Json(json!({"access_token": format!("tok-{}", n), "expires_in": 3600}))
                }),
            )
            .with_state(counter),
    )
    .await;

    let strategy = Arc::new(AuthStrategy::build(Some(&oauth_runtime_config(addr))).unwrap());
    let http = Arc::new(client());

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let strategy = strategy.clone();
        let http = http.clone();
        tasks.push(tokio::spawn(
            async move { strategy.headers(&http).await.unwrap() },
        ));
    }
    let mut bearers = Vec::new();
    for task in tasks {
        let headers = task.await.unwrap();
        bearers.push(headers[0].1.clone());
    }

    // Exactly one network call; every caller carries the same bearer.
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(bearers.iter().all(|b| b == "Bearer tok-1"));
}

#[tokio::test]
async fn test_cached_token_is_reused_across_sequential_requests() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let addr = spawn_server(
        Router::new()
            .route(
                "/token",
                post(|State(counter): State<Arc<AtomicUsize>>| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"access_token": "tok", "expires_in": 3600}))
                }),
            )
            .with_state(counter),
    )
    .await;

    let strategy = AuthStrategy::build(Some(&oauth_runtime_config(addr))).unwrap();
    let http = client();
    for _ in 0..5 {
        strategy.headers(&http).await.unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_azure_ad_posts_client_credentials_form() {
    let bodies: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = bodies.clone();
    let addr = spawn_server(
        Router::new()
            .route(
                "/tenant/token",
                post(
                    |State(seen): State<Arc<std::sync::Mutex<Vec<String>>>>, body: String| async move {
                        seen.lock().unwrap().push(body);
                        Json(json!({"access_token": "aad-token", "expires_in": 1800}))
                    },
                ),
            )
            .with_state(seen),
    )
    .await;

    std::env::set_var("AAD_TEST_CLIENT_ID", "client-1");
    std::env::set_var("AAD_TEST_CLIENT_SECRET", "secret-1");
    let config = AuthConfig::Azuread {
        client_id_env: "AAD_TEST_CLIENT_ID".to_string(),
        client_secret_env: "AAD_TEST_CLIENT_SECRET".to_string(),
        token_endpoint: format!("http://{}/tenant/token", addr),
        resource: "https://management.azure.com/".to_string(),
    };

    let strategy = AuthStrategy::build(Some(&config)).unwrap();
    let headers = strategy.headers(&client()).await.unwrap();
    assert_eq!(headers[0].1, "Bearer aad-token");

    let bodies = bodies.lock().unwrap();
    assert!(bodies[0].contains("grant_type=client_credentials"));
    assert!(bodies[0].contains("client_id=client-1"));
}

#[tokio::test]
async fn test_static_strategies_inject_expected_headers() {
    // Echo server that returns received headers so the full request path is
    // exercised, not just strategy construction.
    let addr = spawn_server(Router::new().route(
        "/echo",
        get(|headers: HeaderMap| async move {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let key = headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(json!({"authorization": auth, "x-api-key": key}))
        }),
    ))
    .await;

    std::env::set_var("STATIC_TEST_TOKEN", "static-token");
    let oauth_static = AuthConfig::Oauth {
        token_env: Some("STATIC_TEST_TOKEN".to_string()),
        username_env: None,
        password_env: None,
        get_token_endpoint: None,
        token_key: None,
        body_data: None,
        get_token_method: HttpMethod::Post,
        token_headers: HashMap::new(),
    };
    let strategy = AuthStrategy::build(Some(&oauth_static)).unwrap();
    let http = client();
    let headers = strategy.headers(&http).await.unwrap();
    assert_eq!(
        headers,
        vec![("Authorization".to_string(), "Bearer static-token".to_string())]
    );

    std::env::set_var("STATIC_TEST_KEY", "k-123");
    let apikey = AuthConfig::Apikey {
        key_name: "x-api-key".to_string(),
        key_value_env: "STATIC_TEST_KEY".to_string(),
    };
    let strategy = AuthStrategy::build(Some(&apikey)).unwrap();
    let headers = strategy.headers(&http).await.unwrap();

    let response = http
        .request(otelbridge::http::RequestSpec {
            method: HttpMethod::Get,
            url: format!("http://{}/echo", addr),
            headers,
            query: Vec::new(),
            raw_query: Vec::new(),
            body: None,
        })
        .await
        .unwrap();
    let echoed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(echoed["x-api-key"], "k-123");
}
