use crate::config::Settings;
use crate::proxy::{
    ClientFactory, FileRecorder, Forwarder, HeaderMergeConfig, ProxyRouteConfig, ProxyService,
    ReplayEngine, TokenAcquirer, TokenRequestConfig, TrafficRecorder,
};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

/// Main application struct that wires settings into the proxy components
pub struct Application {
    settings: Settings,
    route: ProxyRouteConfig,
    forwarder: Forwarder,
    record_directory: PathBuf,
}

impl Application {
    /// Validate settings and load the header merge and token request files.
    /// Any missing or malformed file aborts startup.
    #[instrument(skip_all)]
    pub fn build(settings: Settings) -> Result<Self> {
        let route = settings.route_config()?;
        let clients = ClientFactory::new(settings.outbound_settings()?);

        let merge_headers = match &settings.proxy.merge_header_file {
            Some(path) => HeaderMergeConfig::load(path)?,
            None => HeaderMergeConfig::default(),
        };
        let token = settings
            .proxy
            .token_request_file
            .as_deref()
            .map(TokenRequestConfig::load)
            .transpose()?
            .map(|config| TokenAcquirer::new(config, clients.clone()));

        let forwarder = Forwarder::new(clients, merge_headers, token);
        let record_directory = settings.record_directory();

        Ok(Self {
            settings,
            route,
            forwarder,
            record_directory,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn route(&self) -> &ProxyRouteConfig {
        &self.route
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn record_directory(&self) -> &PathBuf {
        &self.record_directory
    }

    pub fn service(&self) -> ProxyService {
        let recorder: Option<Arc<dyn TrafficRecorder>> = self
            .route
            .logging_enabled
            .then(|| {
                Arc::new(FileRecorder::new(self.record_directory.clone())) as Arc<dyn TrafficRecorder>
            });
        ProxyService::new(self.forwarder.clone(), self.route.clone(), recorder)
    }

    pub fn router(&self) -> axum::Router {
        self.service().into_router(self.settings.proxy.cors_permissive)
    }

    pub fn replay_engine(&self) -> ReplayEngine {
        ReplayEngine::new(
            self.forwarder.clone(),
            self.route.clone(),
            self.record_directory.clone(),
        )
    }

    pub fn listen_address(&self) -> Result<SocketAddr> {
        let address = format!(
            "{}:{}",
            self.settings.application.host, self.settings.application.port
        );
        address
            .parse()
            .map_err(|error: std::net::AddrParseError| Error::InvalidAddress {
                address: address.clone(),
                reason: error.to_string(),
            })
    }

    /// Log what the server is about to do
    pub fn log_startup_summary(&self) {
        let proxy = &self.settings.proxy;
        let merge = self.forwarder.merge_headers();
        if !merge.is_empty() {
            let names: Vec<&str> = merge.headers().names().collect();
            info!(headers = ?names, "Merging headers into every request");
        }
        if let Some(token) = self.forwarder.token_acquirer() {
            let config = token.config();
            info!(
                endpoint = %config.url,
                method = %config.method,
                field = %config.token_field,
                "Bearer token requested per request"
            );
        }

        let clients = self.forwarder.clients();
        match clients.upstream_proxy() {
            Some(upstream) => info!(
                proxy = %upstream.redacted(),
                authenticated = upstream.has_credentials(),
                "Routing outbound traffic through upstream proxy"
            ),
            None => info!("Connecting to targets directly"),
        }
        if proxy.ssl_no_verify && proxy.ssl_cert_file.is_some() {
            warn!("Both ssl_no_verify and ssl_cert_file are set; certificate verification stays disabled");
        }
        info!(tls = %clients.tls().describe(), "TLS verification");

        info!(
            target = %self.route.target_url,
            flatten_content = self.route.flatten_content,
            replace_tool_roles = self.route.replace_tool_roles,
            remove_null_tool_calls = self.route.remove_null_tool_calls,
            proxy_debug = self.route.proxy_debug,
            cors_permissive = proxy.cors_permissive,
            "Request transforms"
        );
        if self.route.logging_enabled {
            info!(directory = %self.record_directory.display(), "Recording requests and responses");
        }
    }

    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let address = self.listen_address()?;
        self.log_startup_summary();

        let listener = TcpListener::bind(address).await?;
        info!("Starting chat relay on {}", listener.local_addr()?);

        axum::serve(listener, self.router()).await?;

        info!("Server stopped");
        Ok(())
    }
}
