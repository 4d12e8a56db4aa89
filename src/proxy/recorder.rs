//! Traffic recording for later replay
//!
//! Each forwarded call produces a request record and a response record,
//! written as pretty JSON next to each other:
//! `{YYYYmmdd_HHMMSS}_{request_id}_request.json` and
//! `{YYYYmmdd_HHMMSS}_{request_id}_response.json`.
//!
//! Recording is best-effort. Writes run on spawned tasks and failures are
//! logged, never returned to the caller.

use crate::proxy::headers::Headers;
use crate::proxy::types::{ProxyRequest, RequestId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const REQUEST_SUFFIX: &str = "_request.json";
pub const RESPONSE_SUFFIX: &str = "_response.json";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

fn default_method() -> String {
    http::Method::POST.to_string()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// The raw inbound request, before any transform
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Target the request was forwarded to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestRecord {
    pub fn capture(request: &ProxyRequest, request_id: RequestId, url: Option<String>) -> Self {
        Self {
            timestamp: Some(now_rfc3339()),
            request_id: request_id.to_string(),
            path: request.path.clone(),
            method: request.method.to_string(),
            url,
            headers: request.headers.clone(),
            body: request.body.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub timestamp: String,
    pub request_id: String,
    pub status_code: u16,
    pub headers: Headers,
    pub body: Value,
}

impl ResponseRecord {
    pub fn capture(request_id: RequestId, status: u16, headers: Headers, body: Value) -> Self {
        Self {
            timestamp: now_rfc3339(),
            request_id: request_id.to_string(),
            status_code: status,
            headers,
            body,
        }
    }
}

/// JSON when the bytes parse as JSON, text otherwise
pub fn body_to_value(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// File name stem shared by the two records of one call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordKey {
    stamp: String,
    request_id: RequestId,
}

impl RecordKey {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            stamp: chrono::Utc::now().format(STAMP_FORMAT).to_string(),
            request_id,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn request_file_name(&self) -> String {
        format!("{}_{}{REQUEST_SUFFIX}", self.stamp, self.request_id)
    }

    pub fn response_file_name(&self) -> String {
        format!("{}_{}{RESPONSE_SUFFIX}", self.stamp, self.request_id)
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to write record {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Sink for request/response records
#[async_trait]
pub trait TrafficRecorder: Send + Sync {
    async fn record_request(
        &self,
        key: &RecordKey,
        record: &RequestRecord,
    ) -> Result<PathBuf, RecordError>;

    async fn record_response(
        &self,
        key: &RecordKey,
        record: &ResponseRecord,
    ) -> Result<PathBuf, RecordError>;
}

/// Writes records as files in one directory, created on demand
#[derive(Clone, Debug)]
pub struct FileRecorder {
    directory: PathBuf,
}

impl FileRecorder {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write to a temporary name and rename, so readers never see a
    /// half-written record.
    async fn write_record<T: Serialize + Sync>(
        &self,
        file_name: &str,
        record: &T,
    ) -> Result<PathBuf, RecordError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| RecordError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(io_error(&self.directory))?;

        let path = self.directory.join(file_name);
        let staging = self.directory.join(format!("{file_name}.tmp"));
        let contents = serde_json::to_vec_pretty(record)?;

        tokio::fs::write(&staging, contents)
            .await
            .map_err(io_error(&staging))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(io_error(&path))?;

        debug!(path = %path.display(), "Record written");
        Ok(path)
    }
}

#[async_trait]
impl TrafficRecorder for FileRecorder {
    async fn record_request(
        &self,
        key: &RecordKey,
        record: &RequestRecord,
    ) -> Result<PathBuf, RecordError> {
        self.write_record(&key.request_file_name(), record).await
    }

    async fn record_response(
        &self,
        key: &RecordKey,
        record: &ResponseRecord,
    ) -> Result<PathBuf, RecordError> {
        self.write_record(&key.response_file_name(), record).await
    }
}

/// Record a request without waiting for the write
pub fn spawn_request_record(
    recorder: Arc<dyn TrafficRecorder>,
    key: RecordKey,
    record: RequestRecord,
) {
    tokio::spawn(async move {
        if let Err(error) = recorder.record_request(&key, &record).await {
            warn!(request_id = %key.request_id(), %error, "Failed to record request");
        }
    });
}

/// Record a response without waiting for the write
pub fn spawn_response_record(
    recorder: Arc<dyn TrafficRecorder>,
    key: RecordKey,
    record: ResponseRecord,
) {
    tokio::spawn(async move {
        if let Err(error) = recorder.record_response(&key, &record).await {
            warn!(request_id = %key.request_id(), %error, "Failed to record response");
        }
    });
}

/// Response record for a body that was fully read
pub fn response_record_from_bytes(
    request_id: RequestId,
    status: u16,
    headers: Headers,
    body: &Bytes,
) -> ResponseRecord {
    ResponseRecord::capture(request_id, status, headers, body_to_value(body))
}

/// Find the request record for an identifier in `directory`.
///
/// The identifier may be a request id, a file name or a file stem.
pub async fn find_request_record(directory: &Path, identifier: &str) -> io::Result<Option<PathBuf>> {
    let id_suffix = format!("_{identifier}{REQUEST_SUFFIX}");
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };

    let mut matches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(REQUEST_SUFFIX) {
            continue;
        }
        let stem = file_name.trim_end_matches(".json");
        if file_name == identifier || stem == identifier || file_name.ends_with(&id_suffix) {
            matches.push(entry.path());
        }
    }

    // Latest stamp wins when an id was recorded more than once
    matches.sort();
    Ok(matches.pop())
}
