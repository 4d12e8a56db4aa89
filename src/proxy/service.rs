//! Main proxy service implementation
//!
//! The `ProxyService` is the inbound boundary: it turns axum requests into
//! [`ProxyRequest`]s, hands them to the [`Forwarder`], records traffic when
//! enabled and relays the upstream response.
//!
//! ## Service Lifecycle
//!
//! ```rust,ignore
//! use chat_relay::proxy::{Forwarder, ProxyService};
//!
//! let service = ProxyService::new(forwarder, route, None);
//! let router = service.into_router(false);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, router).await?;
//! ```

use crate::proxy::error_response::{ErrorReply, ErrorResponseExt};
use crate::proxy::forwarder::Forwarder;
use crate::proxy::headers::{paths, Headers, X_REQUEST_ID};
use crate::proxy::recorder::{
    body_to_value, response_record_from_bytes, spawn_request_record, spawn_response_record,
    RecordKey, RequestRecord, ResponseRecord, TrafficRecorder,
};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UrlResolver;
use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use http::{HeaderValue, Method};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Largest inbound body accepted
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

struct ServiceState {
    forwarder: Forwarder,
    route: ProxyRouteConfig,
    recorder: Option<Arc<dyn TrafficRecorder>>,
}

/// Main proxy service
#[derive(Clone)]
pub struct ProxyService {
    state: Arc<ServiceState>,
}

impl ProxyService {
    /// Create a new proxy service. Traffic is recorded only when a recorder
    /// is given and the route enables logging.
    pub fn new(
        forwarder: Forwarder,
        route: ProxyRouteConfig,
        recorder: Option<Arc<dyn TrafficRecorder>>,
    ) -> Self {
        let recorder = recorder.filter(|_| route.logging_enabled);
        Self {
            state: Arc::new(ServiceState {
                forwarder,
                route,
                recorder,
            }),
        }
    }

    pub fn route(&self) -> &ProxyRouteConfig {
        &self.state.route
    }

    /// Create an Axum router for the proxy service
    pub fn into_router(self, cors_permissive: bool) -> axum::Router {
        let router = axum::Router::new()
            .route(paths::HEALTH, axum::routing::get(health_handler))
            .fallback(proxy_handler)
            .with_state(self);

        let router = if cors_permissive {
            router.layer(CorsLayer::very_permissive())
        } else {
            router
        };
        router.layer(TraceLayer::new_for_http())
    }

    /// Forward one parsed request and build the caller's response
    pub async fn handle(&self, request: ProxyRequest, request_id: RequestId) -> Response {
        let state = &self.state;
        let key = RecordKey::new(request_id);

        if let Some(recorder) = &state.recorder {
            let url = UrlResolver::resolve(&state.route.target_url, &request.path)
                .ok()
                .map(|url| url.to_string());
            spawn_request_record(
                Arc::clone(recorder),
                key.clone(),
                RequestRecord::capture(&request, request_id, url),
            );
        }

        let forwarded = match state
            .forwarder
            .forward(&request, &state.route, request_id)
            .await
        {
            Ok(forwarded) => forwarded,
            Err(error) => {
                warn!(request_id = %request_id, %error, "Forwarding failed");
                let reply = ErrorReply::new(error, request_id, state.route.proxy_debug);
                if let Some(recorder) = &state.recorder {
                    let document = serde_json::to_value(reply.to_error_response())
                        .unwrap_or_default();
                    spawn_response_record(
                        Arc::clone(recorder),
                        key,
                        ResponseRecord::capture(
                            request_id,
                            reply.error.status_code().as_u16(),
                            Headers::new(),
                            document,
                        ),
                    );
                }
                return reply.into_response();
            }
        };

        let upstream = forwarded.response;
        let status = upstream.status;
        let recorded_headers = Headers::from_header_map(&upstream.headers);

        let body = match (upstream.body, &state.recorder) {
            (ResponseBody::Buffered(bytes), Some(recorder)) => {
                spawn_response_record(
                    Arc::clone(recorder),
                    key,
                    response_record_from_bytes(request_id, status.as_u16(), recorded_headers, &bytes),
                );
                Body::from(bytes)
            }
            (ResponseBody::Buffered(bytes), None) => Body::from(bytes),
            (ResponseBody::Streaming(chunks), Some(recorder)) => {
                let recorder = Arc::clone(recorder);
                Body::from_stream(tee_stream(chunks, move |captured| {
                    spawn_response_record(
                        recorder,
                        key,
                        ResponseRecord::capture(
                            request_id,
                            status.as_u16(),
                            recorded_headers,
                            body_to_value(&captured),
                        ),
                    );
                }))
            }
            (ResponseBody::Streaming(chunks), None) => Body::from_stream(chunks),
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = upstream.headers;
        set_request_id(&mut response, request_id);
        response
    }
}

/// Pass chunks through unchanged and hand the accumulated body to
/// `on_complete` once the upstream stream ends.
fn tee_stream<F>(
    chunks: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    on_complete: F,
) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static
where
    F: FnOnce(Bytes) + Send + 'static,
{
    stream::unfold(
        (chunks, BytesMut::new(), Some(on_complete)),
        |(mut chunks, mut captured, mut on_complete)| async move {
            match chunks.next().await {
                Some(Ok(chunk)) => {
                    captured.extend_from_slice(&chunk);
                    Some((Ok(chunk), (chunks, captured, on_complete)))
                }
                Some(Err(error)) => Some((Err(error), (chunks, captured, on_complete))),
                None => {
                    if let Some(on_complete) = on_complete.take() {
                        on_complete(captured.freeze());
                    }
                    None
                }
            }
        },
    )
}

fn set_request_id(response: &mut Response, request_id: RequestId) {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
}

/// Methods whose body is ignored rather than validated
fn body_optional(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Parse an inbound body: empty means no body, anything else must be JSON
/// for methods that carry one.
pub fn parse_body(method: &Method, bytes: &[u8]) -> ProxyResult<Option<serde_json::Value>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(Some(value)),
        Err(_) if body_optional(method) => Ok(None),
        Err(error) => Err(ProxyError::InvalidBody(error.to_string())),
    }
}

/// Axum handler for proxying requests
async fn proxy_handler(State(proxy): State<ProxyService>, request: Request) -> Response {
    // Generate request ID for correlation
    let request_id = RequestId::new();
    let debug = proxy.route().proxy_debug;

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return ErrorReply::new(ProxyError::InvalidBody(error.to_string()), request_id, debug)
                .into_response();
        }
    };
    let body = match parse_body(&parts.method, &bytes) {
        Ok(body) => body,
        Err(error) => return ErrorReply::new(error, request_id, debug).into_response(),
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(paths::DEFAULT)
        .to_string();

    let request = ProxyRequest {
        method: parts.method,
        path,
        headers: Headers::from_header_map(&parts.headers),
        body,
    };

    proxy.handle(request, request_id).await
}

/// Health check handler
async fn health_handler() -> &'static str {
    "OK"
}
