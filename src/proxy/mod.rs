//! Forwarding proxy for chat completion APIs
//!
//! Inbound requests pass through a fixed transform chain, are forwarded to
//! the target (optionally through an upstream network proxy) and can be
//! recorded for replay through the very same chain.

pub mod client;
pub mod connectivity;
pub mod error_response;
pub mod forwarder;
pub mod headers;
pub mod recorder;
pub mod replay;
pub mod service;
pub mod token;
pub mod transforms;
pub mod types;
pub mod url_resolver;

pub use client::{ClientFactory, OutboundSettings, ProxyCredentials, TlsVerification, UpstreamProxyConfig};
pub use forwarder::{Forwarded, Forwarder};
pub use recorder::{FileRecorder, TrafficRecorder};
pub use replay::{ReplayEngine, ReplayError, ReplayReport};
pub use service::ProxyService;
pub use token::{TokenAcquirer, TokenError, TokenRequestConfig};
pub use transforms::{HeaderMergeConfig, TransformPipeline, TransformStep};
pub use types::{ProxyError, ProxyRequest, ProxyResult, ProxyRouteConfig, RequestId, TargetUrl};
