//! Replay of recorded requests
//!
//! A request record is loaded read-only, rebuilt into a [`ProxyRequest`] and
//! sent through the same [`Forwarder`] as live traffic.

use crate::proxy::forwarder::Forwarder;
use crate::proxy::headers::{content_types, Headers, CONTENT_TYPE};
use crate::proxy::recorder::{find_request_record, RequestRecord};
use crate::proxy::types::*;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Error reading log file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Invalid JSON in log file {}: {source}", path.display())]
    InvalidRecord {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid HTTP method in log file: {0}")]
    InvalidMethod(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl ReplayError {
    /// Short headline for reports
    pub fn headline(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "File not found",
            Self::Read { .. } => "Error reading log file",
            Self::InvalidRecord { .. } | Self::InvalidMethod(_) => "Invalid log file",
            Self::Proxy(ProxyError::TokenAcquisition(_)) => "Token request failed",
            Self::Proxy(ProxyError::Timeout(_)) => "Request timeout",
            Self::Proxy(ProxyError::ProxyAuthRejected { .. }) => "Proxy authentication failed",
            Self::Proxy(ProxyError::UpstreamProxy { .. }) => "Proxy error",
            Self::Proxy(_) => "Request error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayInfo {
    pub original_timestamp: Option<String>,
    pub replay_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_seconds: Option<f64>,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Value,
}

/// Outcome of one replay, success or failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub replay_info: ReplayInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<OutboundRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ReplayedResponse>,
}

impl ReplayReport {
    fn failure(error: &ReplayError, original_timestamp: Option<String>, file_path: String) -> Self {
        Self {
            success: false,
            error: Some(error.headline().to_string()),
            details: Some(error.to_string()),
            replay_info: ReplayInfo {
                original_timestamp,
                replay_timestamp: chrono::Utc::now().to_rfc3339(),
                response_time_seconds: None,
                file_path,
            },
            request: None,
            response: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

fn pretty_json(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.replay_info;
        if !self.success {
            writeln!(f, "Replay failed: {}", self.error.as_deref().unwrap_or("unknown error"))?;
            if let Some(details) = &self.details {
                writeln!(f, "Details: {details}")?;
            }
            return writeln!(f, "File: {}", info.file_path);
        }

        writeln!(f, "Replay successful")?;
        writeln!(f, "File: {}", info.file_path)?;
        writeln!(
            f,
            "Original timestamp: {}",
            info.original_timestamp.as_deref().unwrap_or("unknown")
        )?;
        writeln!(f, "Replay timestamp: {}", info.replay_timestamp)?;
        if let Some(seconds) = info.response_time_seconds {
            writeln!(f, "Response time: {seconds:.3}s")?;
        }

        if let Some(request) = &self.request {
            writeln!(f)?;
            writeln!(f, "Request: {} {}", request.method, request.url)?;
            writeln!(f, "Headers: {}", pretty_json(&request.headers))?;
            if let Some(body) = &request.body {
                writeln!(f, "Body: {}", pretty_json(body))?;
            }
        }

        if let Some(response) = &self.response {
            writeln!(f)?;
            writeln!(f, "Response status: {}", response.status_code)?;
            writeln!(f, "Headers: {}", pretty_json(&response.headers))?;
            match &response.body {
                Value::String(text) => writeln!(f, "Body:\n{text}")?,
                body => writeln!(f, "Body: {}", pretty_json(body))?,
            }
        }
        Ok(())
    }
}

/// Response content types kept as raw text in reports
const TEXT_CONTENT_TYPES: [&str; 3] = [
    content_types::EVENT_STREAM,
    content_types::NDJSON,
    content_types::TEXT_PLAIN,
];

/// Report body: raw text for streaming/text content types, otherwise JSON
/// when it parses.
pub fn report_body(content_type: Option<&str>, body: &[u8]) -> Value {
    let text = || Value::String(String::from_utf8_lossy(body).into_owned());
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if TEXT_CONTENT_TYPES
        .iter()
        .any(|candidate| content_type.contains(candidate))
    {
        return text();
    }
    serde_json::from_slice(body).unwrap_or_else(|_| text())
}

/// A completed re-forward
#[derive(Debug)]
pub struct Replayed {
    pub outbound: OutboundRequest,
    pub response: ReplayedResponse,
    pub elapsed: Duration,
}

/// Loads records and re-forwards them
#[derive(Clone, Debug)]
pub struct ReplayEngine {
    forwarder: Forwarder,
    route: ProxyRouteConfig,
    record_directory: PathBuf,
}

impl ReplayEngine {
    pub fn new(forwarder: Forwarder, route: ProxyRouteConfig, record_directory: PathBuf) -> Self {
        Self {
            forwarder,
            route,
            record_directory,
        }
    }

    /// A path when one exists, otherwise a record identifier looked up in
    /// the record directory.
    pub async fn resolve_record_path(&self, source: &str) -> Result<PathBuf, ReplayError> {
        let path = Path::new(source);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        find_request_record(&self.record_directory, source)
            .await
            .map_err(|source_error| ReplayError::Read {
                path: self.record_directory.clone(),
                source: source_error,
            })?
            .ok_or_else(|| ReplayError::NotFound(source.to_string()))
    }

    pub async fn load_record(path: &Path) -> Result<RequestRecord, ReplayError> {
        let contents = tokio::fs::read(path).await.map_err(|source| ReplayError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&contents).map_err(|source| ReplayError::InvalidRecord {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rebuild the inbound request a record captured
    pub fn to_request(record: &RequestRecord) -> Result<ProxyRequest, ReplayError> {
        let method = http::Method::from_bytes(record.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ReplayError::InvalidMethod(record.method.clone()))?;

        Ok(ProxyRequest {
            method,
            path: record.path.clone(),
            headers: record.headers.clone(),
            body: record.body.clone(),
        })
    }

    /// Route for a replay: an explicit override, else the configured default
    pub fn route_for(&self, target: Option<&TargetUrl>) -> ProxyRouteConfig {
        match target {
            Some(target_url) => self.route.clone().with_target(target_url.clone()),
            None => self.route.clone(),
        }
    }

    /// URL a record was originally sent to. It is already resolved, so it is
    /// reused verbatim unless the caller overrides the target.
    pub fn recorded_url(record: &RequestRecord, target: Option<&TargetUrl>) -> Option<Url> {
        if target.is_some() {
            return None;
        }
        record.url.as_deref().and_then(|url| Url::parse(url).ok())
    }

    /// Re-forward a loaded record
    pub async fn replay_record(
        &self,
        record: &RequestRecord,
        target: Option<&TargetUrl>,
    ) -> Result<Replayed, ReplayError> {
        let request = Self::to_request(record)?;
        let route = self.route_for(target);
        let exact_url = Self::recorded_url(record, target);

        let forwarded = self
            .forwarder
            .forward_to(&request, &route, exact_url.as_ref(), RequestId::new())
            .await?;
        let status = forwarded.response.status.as_u16();
        let headers = Headers::from_header_map(&forwarded.response.headers);
        let body = forwarded.response.body.collect().await?;

        Ok(Replayed {
            outbound: forwarded.outbound,
            response: ReplayedResponse {
                status_code: status,
                body: report_body(headers.get(CONTENT_TYPE), &body),
                headers,
            },
            elapsed: forwarded.elapsed,
        })
    }

    /// Replay a record given by path or identifier. Never fails: every
    /// problem is part of the report.
    #[instrument(skip(self, target))]
    pub async fn replay(&self, source: &str, target: Option<&TargetUrl>) -> ReplayReport {
        let path = match self.resolve_record_path(source).await {
            Ok(path) => path,
            Err(error) => {
                warn!(%error, "Replay source not found");
                return ReplayReport::failure(&error, None, source.to_string());
            }
        };
        let file_path = path.display().to_string();

        let record = match Self::load_record(&path).await {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, "Replay record could not be loaded");
                return ReplayReport::failure(&error, None, file_path);
            }
        };

        match self.replay_record(&record, target).await {
            Ok(replayed) => {
                info!(
                    status = replayed.response.status_code,
                    elapsed_ms = replayed.elapsed.as_millis() as u64,
                    "Replay complete"
                );
                ReplayReport {
                    success: true,
                    error: None,
                    details: None,
                    replay_info: ReplayInfo {
                        original_timestamp: record.timestamp,
                        replay_timestamp: chrono::Utc::now().to_rfc3339(),
                        response_time_seconds: Some(replayed.elapsed.as_secs_f64()),
                        file_path,
                    },
                    request: Some(replayed.outbound),
                    response: Some(replayed.response),
                }
            }
            Err(error) => {
                warn!(%error, "Replay failed");
                ReplayReport::failure(&error, record.timestamp, file_path)
            }
        }
    }
}
