//! Forwarding engine shared by live traffic and replay
//!
//! Live requests and replays both go through [`Forwarder::forward`], so the
//! transform chain, URL resolution and error classification are identical
//! for the two.

use crate::proxy::client::{ClientFactory, UpstreamProxyConfig};
use crate::proxy::headers::{is_listed, Headers, CONTENT_TYPE, OUTBOUND_EXCLUDED, RESPONSE_EXCLUDED};
use crate::proxy::token::TokenAcquirer;
use crate::proxy::transforms::{HeaderMergeConfig, TransformPipeline};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UrlResolver;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use url::Url;

/// Phrases reqwest and hyper use when a proxy refuses our credentials
const PROXY_AUTH_MARKERS: [&str; 3] = [
    "407",
    "proxy authentication required",
    "proxy authorization required",
];

/// Outcome of a successful forward
#[derive(Debug)]
pub struct Forwarded {
    /// The request as sent, after every transform
    pub outbound: OutboundRequest,
    pub response: UpstreamResponse,
    /// Time until the upstream answered with status and headers
    pub elapsed: Duration,
}

/// Applies transforms and sends requests to the target
#[derive(Clone, Debug)]
pub struct Forwarder {
    clients: ClientFactory,
    merge_headers: Arc<HeaderMergeConfig>,
    token: Option<TokenAcquirer>,
}

impl Forwarder {
    pub fn new(
        clients: ClientFactory,
        merge_headers: HeaderMergeConfig,
        token: Option<TokenAcquirer>,
    ) -> Self {
        Self {
            clients,
            merge_headers: Arc::new(merge_headers),
            token,
        }
    }

    pub fn clients(&self) -> &ClientFactory {
        &self.clients
    }

    pub fn merge_headers(&self) -> &HeaderMergeConfig {
        &self.merge_headers
    }

    pub fn token_acquirer(&self) -> Option<&TokenAcquirer> {
        self.token.as_ref()
    }

    pub fn pipeline(&self, route: &ProxyRouteConfig) -> TransformPipeline {
        TransformPipeline::new(route, Arc::clone(&self.merge_headers), self.token.is_some())
    }

    /// Build the outbound request: fetch a token when configured, run the
    /// transform chain and resolve the target URL. An `exact_url` is used
    /// as is instead of resolving the route's target.
    pub async fn prepare(
        &self,
        request: &ProxyRequest,
        route: &ProxyRouteConfig,
        exact_url: Option<&Url>,
    ) -> ProxyResult<OutboundRequest> {
        let pipeline = self.pipeline(route);

        let token = match (&self.token, pipeline.needs_token()) {
            (Some(acquirer), true) => Some(acquirer.acquire(route.request_timeout.as_duration()).await?),
            _ => None,
        };

        let transformed = pipeline.apply(request, token.as_deref());
        let url = match exact_url {
            Some(url) => url.clone(),
            None => UrlResolver::resolve(&route.target_url, &request.path)?,
        };

        Ok(OutboundRequest {
            method: transformed.method,
            path: transformed.path,
            url: url.to_string(),
            headers: transformed.headers,
            body: transformed.body,
        })
    }

    /// Forward one request to the route's target. The upstream status,
    /// headers and body are returned untouched apart from hop-by-hop headers.
    pub async fn forward(
        &self,
        request: &ProxyRequest,
        route: &ProxyRouteConfig,
        request_id: RequestId,
    ) -> ProxyResult<Forwarded> {
        self.forward_to(request, route, None, request_id).await
    }

    /// Like [`Forwarder::forward`], but sends to `exact_url` verbatim when
    /// one is given.
    #[instrument(skip_all, fields(request_id = %request_id, method = %request.method, path = %request.path))]
    pub async fn forward_to(
        &self,
        request: &ProxyRequest,
        route: &ProxyRouteConfig,
        exact_url: Option<&Url>,
        request_id: RequestId,
    ) -> ProxyResult<Forwarded> {
        let outbound = self.prepare(request, route, exact_url).await?;

        let streaming = request.is_streaming();
        let timeout = if streaming {
            route.stream_timeout.as_duration()
        } else {
            route.request_timeout.as_duration()
        };

        let client = self.clients.build(timeout)?;
        let mut builder = client
            .request(outbound.method.clone(), outbound.url.as_str())
            .headers(outbound_header_map(&outbound.headers)?);
        if let Some(body) = &outbound.body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| ProxyError::Internal(format!("Failed to encode body: {e}")))?;
            if !outbound.headers.contains(CONTENT_TYPE) {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
            }
            builder = builder.body(bytes);
        }

        let started = Instant::now();
        let upstream_proxy = self.clients.upstream_proxy();
        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, timeout, upstream_proxy))?;
        let elapsed = started.elapsed();

        let status = response.status();
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            if let Some(proxy) = upstream_proxy {
                warn!(proxy = %proxy.redacted(), "Upstream proxy rejected credentials");
                return Err(ProxyError::ProxyAuthRejected {
                    proxy_url: proxy.redacted(),
                });
            }
        }

        let headers = relay_headers(response.headers());
        let body = if streaming {
            ResponseBody::Streaming(response.bytes_stream().boxed())
        } else {
            ResponseBody::Buffered(
                response
                    .bytes()
                    .await
                    .map_err(|e| classify_transport_error(&e, timeout, upstream_proxy))?,
            )
        };

        info!(
            status = status.as_u16(),
            target = %outbound.url,
            streaming,
            elapsed_ms = elapsed.as_millis() as u64,
            "Forwarded request"
        );

        Ok(Forwarded {
            outbound,
            response: UpstreamResponse {
                status,
                headers,
                body,
            },
            elapsed,
        })
    }
}

/// Convert the outbound header map, dropping headers the client owns
pub fn outbound_header_map(headers: &Headers) -> ProxyResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_listed(name, OUTBOUND_EXCLUDED) {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            ProxyError::InvalidHeader {
                name: name.to_string(),
            }
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|_| ProxyError::InvalidHeader {
            name: name.to_string(),
        })?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

/// Upstream response headers minus hop-by-hop ones
pub fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_listed(name.as_str(), RESPONSE_EXCLUDED) {
            relayed.append(name.clone(), value.clone());
        }
    }
    relayed
}

/// Full error message including every source in the chain
pub(crate) fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_message = cause.to_string();
        if !message.contains(&cause_message) {
            message.push_str(": ");
            message.push_str(&cause_message);
        }
        source = cause.source();
    }
    message
}

/// Separate proxy-layer failures from target failures
pub fn classify_transport_error(
    error: &reqwest::Error,
    timeout: Duration,
    upstream_proxy: Option<&UpstreamProxyConfig>,
) -> ProxyError {
    if error.is_timeout() {
        return ProxyError::Timeout(timeout);
    }

    let message = error_chain(error);
    if let Some(proxy) = upstream_proxy {
        let lowered = message.to_ascii_lowercase();
        if PROXY_AUTH_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            return ProxyError::ProxyAuthRejected {
                proxy_url: proxy.redacted(),
            };
        }
        if error.is_connect() {
            return ProxyError::UpstreamProxy {
                message,
                proxy_url: proxy.redacted(),
            };
        }
    }

    ProxyError::TargetUnreachable(message)
}
