//! Command-line interface
//!
//! Flags override the loaded [`Settings`]; anything not given on the
//! command line keeps its configured value.

use crate::config::Settings;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "chat_relay",
    version,
    about = "Forwarding proxy for chat completion APIs with request rewriting and replay"
)]
pub struct Cli {
    /// Print the directory where request/response records are stored and exit
    #[arg(long, global = true)]
    pub logs_dir: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the proxy server (default)
    Server(ServerArgs),
    /// Replay a recorded request
    Replay(ReplayArgs),
    /// Check connectivity through an upstream proxy
    TestProxy(TestProxyArgs),
}

impl Cli {
    /// The subcommand to run, `server` with its defaults when none is given
    pub fn command_or_default(self) -> Command {
        self.command
            .unwrap_or_else(|| Command::Server(ServerArgs::default()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CorsMode {
    /// Answer preflight requests locally and allow every origin
    Disable,
    /// Forward CORS requests to the target untouched
    Forward,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Pretty,
    Json,
}

/// Request transform flags shared by `server` and `replay`
#[derive(Args, Debug, Clone, Default)]
pub struct TransformArgs {
    /// Flatten single text-part content lists into plain strings
    #[arg(long)]
    pub flatten_content: bool,

    /// Rewrite "tool-call" and "tool-response" roles to "user"
    #[arg(long)]
    pub no_tool_roles: bool,

    /// Drop "tool_calls" fields that are null
    #[arg(long)]
    pub remove_null_tool_calls: bool,

    /// JSON file of headers merged into every request
    #[arg(long = "merge-header", value_name = "FILE")]
    pub merge_header_file: Option<PathBuf>,

    /// JSON file describing the bearer token request
    #[arg(long = "token-request", value_name = "FILE")]
    pub token_request_file: Option<PathBuf>,
}

impl TransformArgs {
    pub fn apply(&self, settings: &mut Settings) {
        let proxy = &mut settings.proxy;
        proxy.flatten_content |= self.flatten_content;
        proxy.replace_tool_roles |= self.no_tool_roles;
        proxy.remove_null_tool_calls |= self.remove_null_tool_calls;
        if let Some(path) = &self.merge_header_file {
            proxy.merge_header_file = Some(path.clone());
        }
        if let Some(path) = &self.token_request_file {
            proxy.token_request_file = Some(path.clone());
        }
    }
}

/// Upstream proxy and TLS flags
#[derive(Args, Debug, Clone, Default)]
pub struct OutboundArgs {
    /// Upstream proxy URL, e.g. http://proxy.company.com:8080
    #[arg(long)]
    pub proxy_url: Option<String>,

    /// Upstream proxy credentials as username:password
    #[arg(long)]
    pub proxy_auth: Option<String>,

    /// Include proxy details in error responses
    #[arg(long)]
    pub proxy_debug: bool,

    /// Disable TLS certificate verification (insecure)
    #[arg(long)]
    pub ssl_no_verify: bool,

    /// PEM file with additional root certificates
    #[arg(long, value_name = "PEM_FILE")]
    pub ssl_cert_file: Option<PathBuf>,
}

impl OutboundArgs {
    pub fn apply(&self, settings: &mut Settings) {
        let proxy = &mut settings.proxy;
        if let Some(url) = &self.proxy_url {
            proxy.proxy_url = Some(url.clone());
        }
        if let Some(auth) = &self.proxy_auth {
            proxy.proxy_auth = Some(auth.clone());
        }
        proxy.proxy_debug |= self.proxy_debug;
        proxy.ssl_no_verify |= self.ssl_no_verify;
        if let Some(path) = &self.ssl_cert_file {
            proxy.ssl_cert_file = Some(path.clone());
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Target URL requests are forwarded to
    #[arg(long)]
    pub target_url: Option<String>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Record every request and response for replay
    #[arg(long = "log")]
    pub enable_logging: bool,

    /// CORS handling
    #[arg(long, value_enum, value_name = "MODE")]
    pub cors: Option<CorsMode>,

    #[command(flatten)]
    pub transforms: TransformArgs,

    #[command(flatten)]
    pub outbound: OutboundArgs,
}

impl ServerArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.target_url {
            settings.proxy.target_url = url.clone();
        }
        if let Some(host) = &self.host {
            settings.application.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.application.port = port;
        }
        settings.proxy.logging_enabled |= self.enable_logging;
        if let Some(cors) = self.cors {
            settings.proxy.cors_permissive = cors == CorsMode::Disable;
        }
        self.transforms.apply(settings);
        self.outbound.apply(settings);
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Recorded request file, or a record identifier in the log directory
    pub log_file: String,

    /// Override the target URL for this replay
    #[arg(long)]
    pub target_url: Option<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,

    #[command(flatten)]
    pub transforms: TransformArgs,

    #[command(flatten)]
    pub outbound: OutboundArgs,
}

impl ReplayArgs {
    pub fn apply(&self, settings: &mut Settings) {
        self.transforms.apply(settings);
        self.outbound.apply(settings);
    }
}

#[derive(Args, Debug, Clone)]
pub struct TestProxyArgs {
    /// Upstream proxy URL to test
    #[arg(long)]
    pub proxy_url: String,

    /// Upstream proxy credentials as username:password
    #[arg(long)]
    pub proxy_auth: Option<String>,

    /// Disable TLS certificate verification (insecure)
    #[arg(long)]
    pub ssl_no_verify: bool,

    /// PEM file with additional root certificates
    #[arg(long, value_name = "PEM_FILE")]
    pub ssl_cert_file: Option<PathBuf>,
}

impl TestProxyArgs {
    pub fn apply(&self, settings: &mut Settings) {
        let proxy = &mut settings.proxy;
        proxy.proxy_url = Some(self.proxy_url.clone());
        proxy.proxy_auth = self.proxy_auth.clone();
        proxy.ssl_no_verify |= self.ssl_no_verify;
        if let Some(path) = &self.ssl_cert_file {
            proxy.ssl_cert_file = Some(path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn settings() -> Settings {
        Settings::new().unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_server() {
        let cli = Cli::try_parse_from(["chat_relay"]).unwrap();
        assert!(!cli.logs_dir);
        assert!(matches!(cli.command_or_default(), Command::Server(_)));
    }

    #[test]
    fn test_logs_dir_flag() {
        let cli = Cli::try_parse_from(["chat_relay", "--logs-dir"]).unwrap();
        assert!(cli.logs_dir);
    }

    #[test]
    fn test_server_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "chat_relay",
            "server",
            "--target-url",
            "http://localhost:9000/v1/chat/completions",
            "--port",
            "9100",
            "--flatten-content",
            "--no-tool-roles",
            "--log",
            "--cors",
            "disable",
            "--proxy-url",
            "http://proxy.local:3128",
            "--proxy-auth",
            "alice:p@ss",
        ])
        .unwrap();
        let Command::Server(args) = cli.command_or_default() else {
            panic!("expected server command");
        };

        let mut settings = settings();
        args.apply(&mut settings);

        assert_eq!(settings.proxy.target_url, "http://localhost:9000/v1/chat/completions");
        assert_eq!(settings.application.port, 9100);
        assert!(settings.proxy.flatten_content);
        assert!(settings.proxy.replace_tool_roles);
        assert!(!settings.proxy.remove_null_tool_calls);
        assert!(settings.proxy.logging_enabled);
        assert!(settings.proxy.cors_permissive);
        assert_eq!(settings.proxy.proxy_auth.as_deref(), Some("alice:p@ss"));
    }

    #[test]
    fn test_replay_arguments() {
        let cli = Cli::try_parse_from([
            "chat_relay",
            "replay",
            "logs/20240501_100000_abc_request.json",
            "--output",
            "json",
            "--target-url",
            "http://localhost:9000",
        ])
        .unwrap();
        let Command::Replay(args) = cli.command_or_default() else {
            panic!("expected replay command");
        };
        assert_eq!(args.log_file, "logs/20240501_100000_abc_request.json");
        assert_eq!(args.output, OutputFormat::Json);
        assert_eq!(args.target_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_test_proxy_requires_url() {
        assert!(Cli::try_parse_from(["chat_relay", "test-proxy"]).is_err());
        let cli = Cli::try_parse_from([
            "chat_relay",
            "test-proxy",
            "--proxy-url",
            "http://proxy.local:3128",
        ])
        .unwrap();
        assert!(matches!(cli.command_or_default(), Command::TestProxy(_)));
    }
}
