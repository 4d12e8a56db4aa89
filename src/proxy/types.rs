//! Type definitions for the proxy module

use crate::proxy::headers::Headers;
use crate::proxy::token::TokenError;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use nutype::nutype;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ========== Constants ==========

/// Target used when no override is configured
pub const DEFAULT_TARGET_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Timeout for regular forwards and token requests
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeout for forwards whose body asks for a streamed response
pub const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 120;

// ========== Validated Values ==========

/// Target URL for proxying
#[nutype(
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://")),
    derive(Clone, Debug, Display, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
)]
pub struct TargetUrl(String);

/// Timeout in whole seconds
#[nutype(
    validate(predicate = |secs: &u64| *secs > 0),
    derive(Clone, Copy, Debug, Display, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
)]
pub struct TimeoutSecs(u64);

impl TimeoutSecs {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(*self.as_ref())
    }
}

/// Request ID correlating log records, log lines and error responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new RequestId with a v7 UUID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders as 32 hex digits so the id can be embedded in file names
impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// ========== Route Configuration ==========

/// Per-route forwarding behaviour, fixed at startup
#[derive(Clone, Debug)]
pub struct ProxyRouteConfig {
    pub target_url: TargetUrl,
    pub request_timeout: TimeoutSecs,
    pub stream_timeout: TimeoutSecs,
    pub flatten_content: bool,
    pub replace_tool_roles: bool,
    pub remove_null_tool_calls: bool,
    pub logging_enabled: bool,
    /// Attach proxy details to error responses
    pub proxy_debug: bool,
}

impl Default for ProxyRouteConfig {
    fn default() -> Self {
        Self {
            target_url: TargetUrl::try_new(DEFAULT_TARGET_URL.to_string())
                .expect("default target URL is valid"),
            request_timeout: TimeoutSecs::try_new(DEFAULT_REQUEST_TIMEOUT_SECS)
                .expect("default timeout is positive"),
            stream_timeout: TimeoutSecs::try_new(DEFAULT_STREAM_TIMEOUT_SECS)
                .expect("default timeout is positive"),
            flatten_content: false,
            replace_tool_roles: false,
            remove_null_tool_calls: false,
            logging_enabled: false,
            proxy_debug: false,
        }
    }
}

impl ProxyRouteConfig {
    /// Same route, different target
    pub fn with_target(mut self, target_url: TargetUrl) -> Self {
        self.target_url = target_url;
        self
    }
}

// ========== Requests and Responses ==========

/// A request as handed to the forwarding engine
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyRequest {
    pub method: http::Method,
    /// Inbound path and query
    pub path: String,
    pub headers: Headers,
    pub body: Option<Value>,
}

impl ProxyRequest {
    /// True when the body asks the upstream for a streamed response
    pub fn is_streaming(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|body| body.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The request exactly as it leaves the proxy, after all transforms
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundRequest {
    #[serde(serialize_with = "serialize_method")]
    pub method: http::Method,
    pub path: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Value>,
}

fn serialize_method<S: serde::Serializer>(
    method: &http::Method,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

/// Body of an upstream response
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes, reqwest::Error>>),
}

impl ResponseBody {
    /// Drain the body into memory
    pub async fn collect(self) -> ProxyResult<Bytes> {
        match self {
            Self::Buffered(bytes) => Ok(bytes),
            Self::Streaming(mut stream) => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| ProxyError::TargetUnreachable(e.to_string()))?;
                    collected.extend_from_slice(&chunk);
                }
                Ok(Bytes::from(collected))
            }
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Upstream response relayed to the caller untouched
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: ResponseBody,
}

// ========== Errors ==========

/// Errors that can occur while forwarding a single request
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),

    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("Invalid header: {name}")]
    InvalidHeader { name: String },

    #[error("Token request failed: {0}")]
    TokenAcquisition(#[from] TokenError),

    #[error("Proxy authentication failed (407). Please check your proxy credentials.")]
    ProxyAuthRejected { proxy_url: String },

    #[error("Proxy error: {message}")]
    UpstreamProxy { message: String, proxy_url: String },

    #[error("Request error: {0}")]
    TargetUnreachable(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP client configuration error: {0}")]
    ClientBuild(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
