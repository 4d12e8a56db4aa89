//! Shared fixtures for integration tests
//!
//! [`EchoServer`] answers every request with a JSON description of what it
//! received. Pointing the relay's upstream proxy at it shows the
//! absolute-form request a forward proxy would see.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chat_relay::config::Settings;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Inbound header that makes the echo server wait before answering
pub const DELAY_HEADER: &str = "x-echo-delay-ms";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Captured {
    pub method: String,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[derive(Clone)]
pub struct EchoServer {
    pub url: String,
    captured: Arc<Mutex<Vec<Captured>>>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let router = axum::Router::new()
            .fallback(echo)
            .with_state(Arc::clone(&captured));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: format!("http://{address}"),
            captured,
        }
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Captured {
        self.requests().pop().expect("echo server saw no request")
    }
}

async fn echo(State(captured): State<Arc<Mutex<Vec<Captured>>>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    if let Some(delay) = headers.get(DELAY_HEADER).and_then(|ms| ms.parse().ok()) {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let request = Captured {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers,
        body: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
    };
    captured.lock().unwrap().push(request.clone());

    (
        [(http::header::CONTENT_TYPE, "application/json")],
        Json(request),
    )
        .into_response()
}

/// Defaults with nothing inherited from the environment's proxy or TLS setup
pub fn settings_for(target_url: &str) -> Settings {
    let mut settings = Settings::new().unwrap();
    settings.proxy.target_url = target_url.to_string();
    settings.proxy.proxy_url = None;
    settings.proxy.proxy_auth = None;
    settings.proxy.ssl_no_verify = false;
    settings.proxy.ssl_cert_file = None;
    settings.proxy.merge_header_file = None;
    settings.proxy.token_request_file = None;
    settings.proxy.logging_enabled = false;
    settings
}

pub fn chat_request(path: &str, body: &Value) -> http::Request<Body> {
    http::Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Wait for a spawned record write to land
pub async fn wait_for_file(directory: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    for _ in 0..100 {
        if let Ok(entries) = std::fs::read_dir(directory) {
            let found = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .find(|path| path.to_string_lossy().ends_with(suffix));
            if let Some(path) = found {
                return path;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no *{suffix} file appeared in {}", directory.display());
}
