//! Bearer token acquisition
//!
//! A token is fetched with a fresh round-trip before every forward. Nothing
//! is cached: token responses carry no expiry the proxy could key on.

use crate::config::{read_json_document, ConfigError};
use crate::proxy::client::ClientFactory;
use crate::proxy::headers::{content_types, validate_headers, Headers, CONTENT_TYPE};
use http::Method;
use nutype::nutype;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

/// Response field holding the token when none is configured
pub const DEFAULT_TOKEN_FIELD: &str = "access_token";

/// Name of the token field in the token endpoint's JSON response
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Clone, Debug, Display, PartialEq, Eq, AsRef, Deserialize, Serialize)
)]
pub struct TokenField(String);

/// Errors from a single token round-trip
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Token request error: {0}")]
    Transport(String),

    #[error("Token request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Token response is not valid JSON: {body}")]
    InvalidJson { body: String },

    #[error("Token field '{field}' not found in response. Available fields: {available:?}")]
    MissingField {
        field: String,
        available: Vec<String>,
    },

    #[error("Token field '{field}' is empty in response")]
    EmptyField { field: String },

    #[error("HTTP client configuration error: {0}")]
    Client(String),
}

#[derive(Deserialize)]
struct RawTokenRequest {
    url: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    token_field: Option<String>,
}

/// How to reach the token endpoint, loaded once at startup
#[derive(Clone, Debug, PartialEq)]
pub struct TokenRequestConfig {
    pub url: Url,
    pub method: Method,
    pub headers: Headers,
    pub data: Map<String, Value>,
    pub token_field: TokenField,
}

impl TokenRequestConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = read_json_document("Token request config", path)?;
        Self::from_json(document)
    }

    pub fn from_json(document: Value) -> Result<Self, ConfigError> {
        if !document.is_object() {
            return Err(ConfigError::Invalid(
                "Token request config file must contain a JSON object (dictionary)".to_string(),
            ));
        }
        let raw: RawTokenRequest = serde_json::from_value(document)
            .map_err(|e| ConfigError::Invalid(format!("Invalid token request config: {e}")))?;

        let url = raw.url.ok_or(ConfigError::MissingField("url"))?;
        let url = Url::parse(&url)
            .map_err(|e| ConfigError::Invalid(format!("Invalid token request url {url:?}: {e}")))?;

        let method = raw.method.unwrap_or_else(|| Method::POST.to_string());
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::Invalid(format!("Invalid token request method {method:?}")))?;

        validate_headers(&raw.headers)?;

        let token_field =
            TokenField::try_new(raw.token_field.unwrap_or_else(|| DEFAULT_TOKEN_FIELD.to_string()))
                .map_err(|_| ConfigError::Invalid("Token field must not be empty".to_string()))?;

        Ok(Self {
            url,
            method,
            headers: raw.headers,
            data: raw.data,
            token_field,
        })
    }
}

/// Render request data as form or query pairs
pub fn form_pairs(data: &Map<String, Value>) -> Vec<(String, String)> {
    data.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Pull the token out of a token endpoint response body
pub fn extract_token(body: &str, field: &TokenField) -> Result<String, TokenError> {
    let document: Value = serde_json::from_str(body).map_err(|_| TokenError::InvalidJson {
        body: body.to_string(),
    })?;
    let field_name = field.as_ref();

    let value = document
        .as_object()
        .ok_or_else(|| TokenError::MissingField {
            field: field_name.to_string(),
            available: Vec::new(),
        })
        .and_then(|object| {
            object.get(field_name).ok_or_else(|| TokenError::MissingField {
                field: field_name.to_string(),
                available: object.keys().cloned().collect(),
            })
        })?;

    match value {
        Value::Null => Err(TokenError::EmptyField {
            field: field_name.to_string(),
        }),
        Value::String(token) if token.is_empty() => Err(TokenError::EmptyField {
            field: field_name.to_string(),
        }),
        Value::String(token) => Ok(token.clone()),
        other => Ok(other.to_string()),
    }
}

/// Fetches a bearer token through the shared outbound client settings
#[derive(Clone, Debug)]
pub struct TokenAcquirer {
    config: Arc<TokenRequestConfig>,
    clients: ClientFactory,
}

impl TokenAcquirer {
    pub fn new(config: TokenRequestConfig, clients: ClientFactory) -> Self {
        Self {
            config: Arc::new(config),
            clients,
        }
    }

    pub fn config(&self) -> &TokenRequestConfig {
        &self.config
    }

    /// Shape the token request: form data for form-encoded POSTs, query
    /// parameters for GET, JSON otherwise.
    pub fn build_request(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let config = &self.config;
        let mut headers = config.headers.clone();
        if config.method == Method::POST && !headers.contains(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, content_types::FORM_URLENCODED);
        }
        let form_encoded = headers
            .get(CONTENT_TYPE)
            .is_some_and(|value| value.starts_with(content_types::FORM_URLENCODED));

        let mut request = client.request(config.method.clone(), config.url.clone());
        for (name, value) in headers.iter() {
            request = request.header(name, value);
        }

        if config.method == Method::GET {
            request.query(&form_pairs(&config.data))
        } else if config.method == Method::POST && form_encoded {
            request.form(&form_pairs(&config.data))
        } else {
            request.json(&config.data)
        }
    }

    /// Perform one token round-trip. No retries.
    #[instrument(skip(self), fields(url = %self.config.url, method = %self.config.method))]
    pub async fn acquire(&self, timeout: Duration) -> Result<String, TokenError> {
        let client = self
            .clients
            .build(timeout)
            .map_err(|e| TokenError::Client(e.to_string()))?;

        let response = self
            .build_request(&client)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        if !status.is_success() {
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token = extract_token(&body, &self.config.token_field)?;
        debug!("Token acquired");
        Ok(token)
    }
}

fn transport_error(error: reqwest::Error, timeout: Duration) -> TokenError {
    if error.is_timeout() {
        TokenError::Timeout(timeout)
    } else {
        TokenError::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use rstest::rstest;
    use serde_json::json;

    fn field(name: &str) -> TokenField {
        TokenField::try_new(name.to_string()).unwrap()
    }

    fn acquirer(document: Value) -> TokenAcquirer {
        TokenAcquirer::new(
            TokenRequestConfig::from_json(document).unwrap(),
            ClientFactory::default(),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = TokenRequestConfig::from_json(json!({"url": "https://auth.example.com/token"}))
            .unwrap();
        assert_eq!(config.method, Method::POST);
        assert!(config.headers.is_empty());
        assert!(config.data.is_empty());
        assert_eq!(config.token_field.as_ref(), DEFAULT_TOKEN_FIELD);
    }

    #[test]
    fn test_config_upper_cases_method() {
        let config = TokenRequestConfig::from_json(
            json!({"url": "https://auth.example.com/token", "method": "get"}),
        )
        .unwrap();
        assert_eq!(config.method, Method::GET);
    }

    #[rstest]
    #[case(json!({"method": "POST"}), "'url'")]
    #[case(json!(["not", "an", "object"]), "JSON object")]
    #[case(json!({"url": "https://a.example.com", "headers": {"X-Retries": 3}}), "Invalid token request config")]
    #[case(json!({"url": "https://a.example.com", "token_field": "  "}), "must not be empty")]
    #[case(json!({"url": "not a url"}), "Invalid token request url")]
    fn test_config_rejections(#[case] document: Value, #[case] expected: &str) {
        let error = TokenRequestConfig::from_json(document).unwrap_err();
        assert!(
            error.to_string().contains(expected),
            "{error} does not mention {expected}"
        );
    }

    #[rstest]
    #[case(r#"{"access_token": "abc"}"#, "abc")]
    #[case(r#"{"access_token": 12345}"#, "12345")]
    #[case(r#"{"access_token": true}"#, "true")]
    #[case(r#"{"access_token": {"k": "v"}}"#, r#"{"k":"v"}"#)]
    fn test_extract_token_values(#[case] body: &str, #[case] expected: &str) {
        assert_eq!(extract_token(body, &field("access_token")).unwrap(), expected);
    }

    #[test]
    fn test_extract_token_failures() {
        let field = field("access_token");
        assert!(matches!(
            extract_token("<html>", &field),
            Err(TokenError::InvalidJson { .. })
        ));
        assert!(matches!(
            extract_token(r#"{"access_token": ""}"#, &field),
            Err(TokenError::EmptyField { .. })
        ));
        assert!(matches!(
            extract_token(r#"{"access_token": null}"#, &field),
            Err(TokenError::EmptyField { .. })
        ));
        match extract_token(r#"{"token": "abc", "expires_in": 60}"#, &field) {
            Err(TokenError::MissingField { available, .. }) => {
                assert_eq!(available, vec!["token", "expires_in"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_form_pairs_stringify_values() {
        let data = json!({"grant_type": "client_credentials", "ttl": 60, "refresh": false})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(
            form_pairs(&data),
            vec![
                ("grant_type".to_string(), "client_credentials".to_string()),
                ("ttl".to_string(), "60".to_string()),
                ("refresh".to_string(), "false".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_acquire_posts_form_data() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::UrlEncoded(
                "grant_type".to_string(),
                "client_credentials".to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "abc", "token_type": "bearer"}"#)
            .create_async()
            .await;

        let acquirer = acquirer(json!({
            "url": format!("{}/token", server.url()),
            "data": {"grant_type": "client_credentials"}
        }));
        let token = acquirer.acquire(Duration::from_secs(5)).await.unwrap();

        assert_eq!(token, "abc");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_acquire_sends_json_for_non_form_content_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::Json(json!({"client_id": "relay"})))
            .with_status(200)
            .with_body(r#"{"jwt": "signed"}"#)
            .create_async()
            .await;

        let acquirer = acquirer(json!({
            "url": format!("{}/token", server.url()),
            "headers": {"Content-Type": "application/json"},
            "data": {"client_id": "relay"},
            "token_field": "jwt"
        }));

        assert_eq!(acquirer.acquire(Duration::from_secs(5)).await.unwrap(), "signed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_acquire_get_sends_query_parameters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/token")
            .match_query(Matcher::UrlEncoded("scope".to_string(), "chat".to_string()))
            .with_status(200)
            .with_body(r#"{"access_token": "from-get"}"#)
            .create_async()
            .await;

        let acquirer = acquirer(json!({
            "url": format!("{}/token", server.url()),
            "method": "GET",
            "data": {"scope": "chat"}
        }));

        assert_eq!(
            acquirer.acquire(Duration::from_secs(5)).await.unwrap(),
            "from-get"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_acquire_reports_bad_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(401)
            .with_body("invalid_client")
            .create_async()
            .await;

        let acquirer = acquirer(json!({"url": format!("{}/token", server.url())}));
        match acquirer.acquire(Duration::from_secs(5)).await {
            Err(TokenError::Status { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid_client");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_reports_unreachable_endpoint() {
        let acquirer = acquirer(json!({"url": "http://127.0.0.1:1/token"}));
        let error = acquirer.acquire(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            error,
            TokenError::Transport(_) | TokenError::Timeout(_)
        ));
    }
}
