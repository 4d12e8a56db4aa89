//! Connectivity check for the configured upstream proxy

use crate::proxy::client::ClientFactory;
use crate::proxy::forwarder::classify_transport_error;
use crate::proxy::types::ProxyError;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Echo service reporting the caller's public address
pub const CHECK_URL: &str = "https://httpbin.org/ip";

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivityReport {
    pub success: bool,
    pub proxy_url: Option<String>,
    pub status_code: Option<u16>,
    pub elapsed_ms: Option<u64>,
    /// Address the echo service saw the request coming from
    pub origin_ip: Option<String>,
    pub error: Option<String>,
}

impl fmt::Display for ConnectivityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proxy = self.proxy_url.as_deref().unwrap_or("none (direct connection)");
        writeln!(f, "Proxy: {proxy}")?;
        if self.success {
            writeln!(f, "Proxy connection successful")?;
        } else {
            writeln!(f, "Proxy connection failed")?;
        }
        if let Some(status) = self.status_code {
            writeln!(f, "Status: {status}")?;
        }
        if let Some(elapsed) = self.elapsed_ms {
            writeln!(f, "Response time: {elapsed}ms")?;
        }
        if let Some(origin) = &self.origin_ip {
            writeln!(f, "Origin IP: {origin}")?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "Error: {error}")?;
        }
        Ok(())
    }
}

fn describe_failure(error: &ProxyError) -> String {
    match error {
        ProxyError::ProxyAuthRejected { .. } => {
            "Proxy authentication failed (407). Check your credentials.".to_string()
        }
        ProxyError::Timeout(duration) => format!("Connection timeout after {duration:?}"),
        ProxyError::UpstreamProxy { message, .. } => format!("Proxy error: {message}"),
        other => format!("Connection error: {other}"),
    }
}

/// Send one GET through the upstream proxy and report what happened
#[instrument(skip(clients))]
pub async fn check_upstream_proxy(clients: &ClientFactory, url: &str, timeout: Duration) -> ConnectivityReport {
    let mut report = ConnectivityReport {
        success: false,
        proxy_url: clients.upstream_proxy().map(|proxy| proxy.redacted()),
        status_code: None,
        elapsed_ms: None,
        origin_ip: None,
        error: None,
    };

    let client = match clients.build(timeout) {
        Ok(client) => client,
        Err(error) => {
            report.error = Some(error.to_string());
            return report;
        }
    };

    let started = Instant::now();
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(error) => {
            let classified = classify_transport_error(&error, timeout, clients.upstream_proxy());
            warn!(error = %classified, "Proxy connectivity check failed");
            report.error = Some(describe_failure(&classified));
            return report;
        }
    };
    report.elapsed_ms = Some(started.elapsed().as_millis() as u64);

    let status = response.status();
    report.status_code = Some(status.as_u16());
    if status == reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        report.error = Some(describe_failure(&ProxyError::ProxyAuthRejected {
            proxy_url: report.proxy_url.clone().unwrap_or_default(),
        }));
        return report;
    }

    report.success = status.is_success();
    report.origin_ip = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("origin").and_then(Value::as_str).map(str::to_string));
    if !report.success {
        report.error = Some(format!("Unexpected status {status}"));
    }

    info!(success = report.success, status = status.as_u16(), "Proxy connectivity check finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_reports_origin() {
        let mut server = mockito::Server::new_async().await;
        let _ip = server
            .mock("GET", "/ip")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"origin": "203.0.113.7"}"#)
            .create_async()
            .await;

        let report = check_upstream_proxy(
            &ClientFactory::default(),
            &format!("{}/ip", server.url()),
            CHECK_TIMEOUT,
        )
        .await;

        assert!(report.success);
        assert_eq!(report.status_code, Some(200));
        assert_eq!(report.origin_ip.as_deref(), Some("203.0.113.7"));
        assert!(report.elapsed_ms.is_some());
        assert!(report.to_string().contains("Origin IP: 203.0.113.7"));
    }

    #[tokio::test]
    async fn test_check_reports_connection_error() {
        let report =
            check_upstream_proxy(&ClientFactory::default(), "http://127.0.0.1:1/ip", CHECK_TIMEOUT)
                .await;

        assert!(!report.success);
        assert!(report.error.unwrap().starts_with("Connection"));
    }

    #[test]
    fn test_failure_descriptions() {
        let auth = describe_failure(&ProxyError::ProxyAuthRejected {
            proxy_url: String::new(),
        });
        assert!(auth.contains("407"));
        assert!(describe_failure(&ProxyError::Timeout(CHECK_TIMEOUT)).contains("timeout"));
    }
}
