//! Outbound HTTP client construction
//!
//! Every outbound client (forwards, token requests, the proxy connectivity check) is built
//! here so they share the same upstream proxy and TLS settings. Proxy
//! credentials travel inside the proxy URL's authority; reqwest decodes them
//! into a `Proxy-Authorization` header on its own.

use crate::config::ConfigError;
use crate::proxy::types::{ProxyError, ProxyResult};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Environment variables consulted for a CA bundle, highest priority first
pub const CERT_FILE_ENV_VARS: [&str; 2] = ["SSL_CERT_FILE", "REQUESTS_CA_BUNDLE"];

const PEM_CERTIFICATE_MARKER: &str = "-----BEGIN CERTIFICATE-----";

const AUTH_FORMAT_HINT: &str = "Proxy authentication must be in format 'username:password'";

/// Username and password for an authenticated upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    username: String,
    password: String,
}

impl ProxyCredentials {
    /// Parse a `user:pass` string. Only the first colon separates the two
    /// parts, so passwords may contain colons.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (username, password) = raw
            .split_once(':')
            .ok_or_else(|| ConfigError::ProxyAuth(AUTH_FORMAT_HINT.to_string()))?;

        if username.is_empty() || password.is_empty() {
            return Err(ConfigError::ProxyAuth(AUTH_FORMAT_HINT.to_string()));
        }

        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Upstream network proxy every outbound connection is tunnelled through
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxyConfig {
    /// Proxy URL with any credentials already embedded
    url: Url,
}

impl UpstreamProxyConfig {
    /// Validate a proxy URL and embed optional credentials into it.
    ///
    /// A URL without a scheme is treated as `http://`. Credentials given
    /// separately replace any already present in the URL.
    pub fn new(raw: &str, credentials: Option<ProxyCredentials>) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProxyUrl {
            url: raw.to_string(),
            reason,
        };

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        if let Some(credentials) = credentials {
            url.set_username(credentials.username())
                .map_err(|()| invalid("URL cannot carry credentials".to_string()))?;
            url.set_password(Some(credentials.password()))
                .map_err(|()| invalid("URL cannot carry credentials".to_string()))?;
        }

        Ok(Self { url })
    }

    /// Proxy URL including percent-encoded credentials
    pub fn authenticated_url(&self) -> &Url {
        &self.url
    }

    pub fn has_credentials(&self) -> bool {
        !self.url.username().is_empty()
    }

    /// Proxy URL safe for logs and error details
    pub fn redacted(&self) -> String {
        let mut shown = self.url.clone();
        if shown.password().is_some() && shown.set_password(Some("***")).is_err() {
            return format!("{}://***", shown.scheme());
        }
        shown.to_string()
    }
}

impl fmt::Debug for UpstreamProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpstreamProxyConfig")
            .field(&self.redacted())
            .finish()
    }
}

/// How outbound TLS certificates are verified
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// Platform and bundled roots
    #[default]
    System,
    /// No verification at all
    Disabled,
    /// Additional PEM root certificate(s) from a file
    CustomRoot { path: PathBuf, pem: Vec<u8> },
}

impl TlsVerification {
    /// Pick the verification mode from explicit settings, falling back to
    /// the CA bundle environment variables.
    pub fn resolve(no_verify: bool, cert_file: Option<&Path>) -> Result<Self, ConfigError> {
        if no_verify {
            warn!("SSL certificate verification is disabled");
            return Ok(Self::Disabled);
        }

        if let Some(path) = cert_file {
            return Self::custom_root(path.to_path_buf());
        }

        match Self::cert_file_from_env() {
            Some(path) => Self::custom_root(path),
            None => Ok(Self::System),
        }
    }

    /// First CA bundle named by the environment that exists. Stale entries
    /// are skipped with a warning.
    fn cert_file_from_env() -> Option<PathBuf> {
        CERT_FILE_ENV_VARS.iter().find_map(|variable| {
            let path = PathBuf::from(env::var_os(variable).filter(|value| !value.is_empty())?);
            if path.is_file() {
                Some(path)
            } else {
                warn!(variable, path = %path.display(), "CA bundle from environment not found, ignoring");
                None
            }
        })
    }

    fn custom_root(path: PathBuf) -> Result<Self, ConfigError> {
        let certificate_error = |reason: String| ConfigError::Certificate {
            path: path.clone(),
            reason,
        };

        if !path.is_file() {
            return Err(certificate_error("file not found".to_string()));
        }
        let pem = std::fs::read(&path).map_err(|e| certificate_error(e.to_string()))?;
        if pem.iter().all(u8::is_ascii_whitespace) {
            return Err(certificate_error("file is empty".to_string()));
        }
        if !String::from_utf8_lossy(&pem).contains(PEM_CERTIFICATE_MARKER) {
            return Err(certificate_error(
                "file does not appear to be a PEM certificate".to_string(),
            ));
        }
        let certificates = reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|e| certificate_error(e.to_string()))?;
        if certificates.is_empty() {
            return Err(certificate_error("no certificates found".to_string()));
        }

        Ok(Self::CustomRoot { path, pem })
    }

    /// Short description for the startup summary
    pub fn describe(&self) -> String {
        match self {
            Self::System => "system roots".to_string(),
            Self::Disabled => "verification disabled".to_string(),
            Self::CustomRoot { path, .. } => format!("custom root {}", path.display()),
        }
    }
}

/// Process-wide outbound settings, fixed at startup
#[derive(Clone, Debug, Default)]
pub struct OutboundSettings {
    pub upstream_proxy: Option<UpstreamProxyConfig>,
    pub tls: TlsVerification,
}

/// Builds reqwest clients that honour the outbound settings
#[derive(Clone, Debug, Default)]
pub struct ClientFactory {
    settings: Arc<OutboundSettings>,
}

impl ClientFactory {
    pub fn new(settings: OutboundSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn upstream_proxy(&self) -> Option<&UpstreamProxyConfig> {
        self.settings.upstream_proxy.as_ref()
    }

    pub fn tls(&self) -> &TlsVerification {
        &self.settings.tls
    }

    /// Build a client whose whole request, connect included, is bounded by
    /// `timeout`.
    pub fn build(&self, timeout: Duration) -> ProxyResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .tcp_nodelay(true);

        builder = match self.upstream_proxy() {
            Some(upstream) => {
                let proxy = reqwest::Proxy::all(upstream.authenticated_url().as_str())
                    .map_err(|e| ProxyError::ClientBuild(format!("Invalid upstream proxy url: {e}")))?;
                builder.proxy(proxy)
            }
            // Environment proxies are ignored unless configured explicitly
            None => builder.no_proxy(),
        };

        match self.tls() {
            TlsVerification::System => {}
            TlsVerification::Disabled => {
                builder = builder.danger_accept_invalid_certs(true);
            }
            TlsVerification::CustomRoot { pem, .. } => {
                let certificates = reqwest::Certificate::from_pem_bundle(pem)
                    .map_err(|e| ProxyError::ClientBuild(format!("Invalid root certificate: {e}")))?;
                for certificate in certificates {
                    builder = builder.add_root_certificate(certificate);
                }
            }
        }

        builder
            .build()
            .map_err(|e| ProxyError::ClientBuild(format!("Failed to build HTTP client: {e}")))
    }
}
