use crate::proxy::client::{OutboundSettings, ProxyCredentials, TlsVerification, UpstreamProxyConfig};
use crate::proxy::types::{
    ProxyRouteConfig, TargetUrl, TimeoutSecs, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_STREAM_TIMEOUT_SECS, DEFAULT_TARGET_URL,
};
use ::config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Directory name under the platform data directory
pub const APP_DIR_NAME: &str = "chat-relay";

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "CHAT_RELAY";

/// Configuration errors, all raised before any request is served
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),

    #[error("{kind} file not found: {}", path.display())]
    FileNotFound { kind: &'static str, path: PathBuf },

    #[error("Failed to read {kind} file {}: {source}", path.display())]
    Read {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {kind} file {}: {source}", path.display())]
    InvalidJson {
        kind: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("Token request config must contain '{0}' field")]
    MissingField(&'static str),

    #[error("Invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("{0}")]
    ProxyAuth(String),

    #[error("Invalid proxy URL {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    #[error("Invalid SSL certificate file {}: {reason}", path.display())]
    Certificate { path: PathBuf, reason: String },

    #[error("Invalid target URL {0:?}: must start with http:// or https://")]
    InvalidTargetUrl(String),

    #[error("Invalid timeout for {0}: must be at least one second")]
    InvalidTimeout(&'static str),
}

/// Read a file and parse it as JSON, naming the document kind in errors
pub(crate) fn read_json_document(kind: &'static str, path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            kind,
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        kind,
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::InvalidJson {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub proxy: ProxySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub target_url: String,
    pub request_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub flatten_content: bool,
    pub replace_tool_roles: bool,
    pub remove_null_tool_calls: bool,
    pub logging_enabled: bool,
    pub proxy_debug: bool,
    pub cors_permissive: bool,
    #[serde(default)]
    pub merge_header_file: Option<PathBuf>,
    #[serde(default)]
    pub token_request_file: Option<PathBuf>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_auth: Option<String>,
    pub ssl_no_verify: bool,
    #[serde(default)]
    pub ssl_cert_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8000)?
            .set_default("proxy.target_url", DEFAULT_TARGET_URL)?
            .set_default("proxy.request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
            .set_default("proxy.stream_timeout_secs", DEFAULT_STREAM_TIMEOUT_SECS)?
            .set_default("proxy.flatten_content", false)?
            .set_default("proxy.replace_tool_roles", false)?
            .set_default("proxy.remove_null_tool_calls", false)?
            .set_default("proxy.logging_enabled", false)?
            .set_default("proxy.proxy_debug", false)?
            .set_default("proxy.cors_permissive", false)?
            .set_default("proxy.ssl_no_verify", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Route configuration with validated target and timeouts
    pub fn route_config(&self) -> Result<ProxyRouteConfig, ConfigError> {
        let proxy = &self.proxy;
        let target_url = TargetUrl::try_new(proxy.target_url.clone())
            .map_err(|_| ConfigError::InvalidTargetUrl(proxy.target_url.clone()))?;
        let request_timeout = TimeoutSecs::try_new(proxy.request_timeout_secs)
            .map_err(|_| ConfigError::InvalidTimeout("request_timeout_secs"))?;
        let stream_timeout = TimeoutSecs::try_new(proxy.stream_timeout_secs)
            .map_err(|_| ConfigError::InvalidTimeout("stream_timeout_secs"))?;

        Ok(ProxyRouteConfig {
            target_url,
            request_timeout,
            stream_timeout,
            flatten_content: proxy.flatten_content,
            replace_tool_roles: proxy.replace_tool_roles,
            remove_null_tool_calls: proxy.remove_null_tool_calls,
            logging_enabled: proxy.logging_enabled,
            proxy_debug: proxy.proxy_debug,
        })
    }

    /// Upstream proxy and TLS settings shared by every outbound client
    pub fn outbound_settings(&self) -> Result<OutboundSettings, ConfigError> {
        let proxy = &self.proxy;
        let upstream_proxy = match (&proxy.proxy_url, &proxy.proxy_auth) {
            (Some(url), auth) => {
                let credentials = auth.as_deref().map(ProxyCredentials::parse).transpose()?;
                Some(UpstreamProxyConfig::new(url, credentials)?)
            }
            (None, Some(_)) => {
                warn!("Proxy authentication given without a proxy URL; it will be ignored");
                None
            }
            (None, None) => None,
        };
        let tls = TlsVerification::resolve(proxy.ssl_no_verify, proxy.ssl_cert_file.as_deref())?;

        Ok(OutboundSettings {
            upstream_proxy,
            tls,
        })
    }

    /// Directory holding request/response records
    pub fn record_directory(&self) -> PathBuf {
        self.logging
            .directory
            .clone()
            .unwrap_or_else(default_record_directory)
    }
}

/// Platform data directory joined with the application log folder
pub fn default_record_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings() -> Settings {
        Settings::new().unwrap()
    }

    #[test]
    fn test_settings_can_be_loaded() {
        let settings = Settings::new();
        assert!(settings.is_ok());
    }

    #[test]
    fn test_route_config_uses_defaults() {
        let route = settings().route_config().unwrap();
        assert_eq!(route.target_url.as_ref(), DEFAULT_TARGET_URL);
        assert_eq!(*route.request_timeout.as_ref(), DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_route_config_rejects_bad_target() {
        let mut settings = settings();
        settings.proxy.target_url = "openrouter.ai".to_string();
        assert!(matches!(
            settings.route_config(),
            Err(ConfigError::InvalidTargetUrl(_))
        ));
    }

    #[test]
    fn test_route_config_rejects_zero_timeout() {
        let mut settings = settings();
        settings.proxy.request_timeout_secs = 0;
        assert!(matches!(
            settings.route_config(),
            Err(ConfigError::InvalidTimeout("request_timeout_secs"))
        ));
    }

    #[test]
    fn test_outbound_settings_reject_malformed_proxy_auth() {
        let mut settings = settings();
        settings.proxy.proxy_url = Some("http://proxy.local:3128".to_string());
        settings.proxy.proxy_auth = Some("no-colon".to_string());
        settings.proxy.ssl_no_verify = true;
        assert!(matches!(
            settings.outbound_settings(),
            Err(ConfigError::ProxyAuth(_))
        ));
    }

    #[test]
    fn test_proxy_auth_without_url_is_ignored() {
        let mut settings = settings();
        settings.proxy.proxy_auth = Some("user:pass".to_string());
        settings.proxy.ssl_no_verify = true;
        let outbound = settings.outbound_settings().unwrap();
        assert!(outbound.upstream_proxy.is_none());
    }

    #[test]
    fn test_record_directory_prefers_setting() {
        let mut settings = settings();
        settings.logging.directory = Some(PathBuf::from("/tmp/records"));
        assert_eq!(settings.record_directory(), PathBuf::from("/tmp/records"));
        assert!(default_record_directory().ends_with("chat-relay/logs"));
    }

    #[test]
    fn test_read_json_document_errors() {
        let missing = read_json_document("header", Path::new("/definitely/not/here.json"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let invalid = read_json_document("header", file.path());
        assert!(matches!(invalid, Err(ConfigError::InvalidJson { .. })));
    }
}
