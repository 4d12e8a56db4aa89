//! Request transforms applied before forwarding
//!
//! Each transform is a total function: input it does not recognise passes
//! through unchanged. The pipeline always runs them in the order of
//! [`TransformStep::ORDER`]; header writes come first so the token
//! injection is the final word on `Authorization`.

use crate::config::{read_json_document, ConfigError};
use crate::proxy::headers::{validate_headers, Headers, AUTHORIZATION, BEARER_PREFIX};
use crate::proxy::types::{ProxyRequest, ProxyRouteConfig};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Roles replaced by [`rewrite_tool_roles`]
pub const TOOL_ROLES: [&str; 2] = ["tool-call", "tool-response"];

/// Role written in place of a tool role
pub const REWRITTEN_ROLE: &str = "user";

/// Headers forced onto every outbound request, loaded once at startup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMergeConfig(Headers);

impl HeaderMergeConfig {
    pub fn new(headers: Headers) -> Result<Self, ConfigError> {
        validate_headers(&headers)?;
        Ok(Self(headers))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = read_json_document("Header merge", path)?;
        Self::from_json(document)
    }

    /// Accepts a JSON object whose values are all strings
    pub fn from_json(document: Value) -> Result<Self, ConfigError> {
        let Value::Object(entries) = document else {
            return Err(ConfigError::Invalid(
                "Header file must contain a JSON object (dictionary)".to_string(),
            ));
        };

        let mut headers = Headers::new();
        for (name, value) in entries {
            let Value::String(value) = value else {
                return Err(ConfigError::InvalidHeader {
                    name,
                    reason: "value must be a string".to_string(),
                });
            };
            headers.insert(name, value);
        }
        Self::new(headers)
    }

    pub fn headers(&self) -> &Headers {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ========== Header transforms ==========

/// Union of both maps; on a case-insensitive clash the override's value
/// and spelling win.
pub fn merge_headers(request: &Headers, overrides: &Headers) -> Headers {
    let mut merged = request.clone();
    for (name, value) in overrides.iter() {
        merged.insert(name, value);
    }
    merged
}

/// Overwrite any Authorization header with `Bearer {token}`
pub fn inject_bearer_token(headers: &mut Headers, token: &str) {
    headers.insert(AUTHORIZATION, format!("{BEARER_PREFIX}{token}"));
}

// ========== Body transforms ==========

fn messages_mut(body: &mut Value) -> impl Iterator<Item = &mut Map<String, Value>> + '_ {
    body.get_mut("messages")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn single_text_part(parts: &[Value]) -> Option<String> {
    let [part] = parts else {
        return None;
    };
    let part = part.as_object()?;
    if part.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    match part.get("text") {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

fn flatten_in_place(body: &mut Value) {
    for message in messages_mut(body) {
        let flattened = match message.get("content") {
            Some(Value::Array(parts)) => single_text_part(parts),
            _ => None,
        };
        if let Some(text) = flattened {
            message.insert("content".to_string(), Value::String(text));
        }
    }
}

fn rewrite_roles_in_place(body: &mut Value) {
    for message in messages_mut(body) {
        let is_tool_role = message
            .get("role")
            .and_then(Value::as_str)
            .is_some_and(|role| TOOL_ROLES.contains(&role));
        if is_tool_role {
            message.insert("role".to_string(), Value::from(REWRITTEN_ROLE));
        }
    }
}

fn remove_null_tool_calls_in_place(body: &mut Value) {
    for message in messages_mut(body) {
        if matches!(message.get("tool_calls"), Some(Value::Null)) {
            message.shift_remove("tool_calls");
        }
    }
}

/// Replace a single-element `[{"type": "text", "text": ...}]` content list
/// with its text. Every other content shape is left alone.
pub fn flatten_content(body: &Value) -> Value {
    let mut body = body.clone();
    flatten_in_place(&mut body);
    body
}

/// Rewrite `tool-call` and `tool-response` roles to `user`
pub fn rewrite_tool_roles(body: &Value) -> Value {
    let mut body = body.clone();
    rewrite_roles_in_place(&mut body);
    body
}

/// Drop `tool_calls` keys whose value is `null`
pub fn remove_null_tool_calls(body: &Value) -> Value {
    let mut body = body.clone();
    remove_null_tool_calls_in_place(&mut body);
    body
}

// ========== Pipeline ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformStep {
    MergeHeaders,
    InjectToken,
    FlattenContent,
    RewriteToolRoles,
    RemoveNullToolCalls,
}

impl TransformStep {
    pub const ORDER: [TransformStep; 5] = [
        TransformStep::MergeHeaders,
        TransformStep::InjectToken,
        TransformStep::FlattenContent,
        TransformStep::RewriteToolRoles,
        TransformStep::RemoveNullToolCalls,
    ];
}

/// The enabled subset of [`TransformStep::ORDER`] for one route
#[derive(Clone, Debug)]
pub struct TransformPipeline {
    steps: Vec<TransformStep>,
    merge: Arc<HeaderMergeConfig>,
}

impl TransformPipeline {
    pub fn new(route: &ProxyRouteConfig, merge: Arc<HeaderMergeConfig>, token_enabled: bool) -> Self {
        let steps = TransformStep::ORDER
            .into_iter()
            .filter(|step| match step {
                TransformStep::MergeHeaders => !merge.is_empty(),
                TransformStep::InjectToken => token_enabled,
                TransformStep::FlattenContent => route.flatten_content,
                TransformStep::RewriteToolRoles => route.replace_tool_roles,
                TransformStep::RemoveNullToolCalls => route.remove_null_tool_calls,
            })
            .collect();

        Self { steps, merge }
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    pub fn needs_token(&self) -> bool {
        self.steps.contains(&TransformStep::InjectToken)
    }

    /// Run every enabled step over a copy of `request`
    pub fn apply(&self, request: &ProxyRequest, token: Option<&str>) -> ProxyRequest {
        let mut transformed = request.clone();

        for step in &self.steps {
            match step {
                TransformStep::MergeHeaders => {
                    transformed.headers = merge_headers(&transformed.headers, self.merge.headers());
                }
                TransformStep::InjectToken => {
                    if let Some(token) = token {
                        inject_bearer_token(&mut transformed.headers, token);
                    }
                }
                TransformStep::FlattenContent => {
                    if let Some(body) = transformed.body.as_mut() {
                        flatten_in_place(body);
                    }
                }
                TransformStep::RewriteToolRoles => {
                    if let Some(body) = transformed.body.as_mut() {
                        rewrite_roles_in_place(body);
                    }
                }
                TransformStep::RemoveNullToolCalls => {
                    if let Some(body) = transformed.body.as_mut() {
                        remove_null_tool_calls_in_place(body);
                    }
                }
            }
        }

        transformed
    }
}
