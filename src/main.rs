use anyhow::{Context, Result};
use chat_relay::cli::{Cli, Command, OutputFormat};
use chat_relay::config::{LogFormat, LoggingSettings, Settings};
use chat_relay::proxy::connectivity::{check_upstream_proxy, CHECK_TIMEOUT, CHECK_URL};
use chat_relay::proxy::{ClientFactory, TargetUrl};
use chat_relay::Application;
use clap::Parser;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so replay and connectivity reports own stdout
fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut settings = Settings::new().context("Failed to load settings")?;

    if cli.logs_dir {
        println!("{}", settings.record_directory().display());
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(&settings.logging);

    match cli.command_or_default() {
        Command::Server(args) => {
            args.apply(&mut settings);
            info!("Starting chat relay");
            Application::build(settings)?.run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Replay(args) => {
            args.apply(&mut settings);
            let target = args
                .target_url
                .as_deref()
                .map(|url| {
                    TargetUrl::try_new(url.to_string())
                        .map_err(|_| anyhow::anyhow!("Invalid target URL: {url}"))
                })
                .transpose()?;

            let app = Application::build(settings)?;
            let report = app
                .replay_engine()
                .replay(&args.log_file, target.as_ref())
                .await;
            match args.output {
                OutputFormat::Json => println!("{}", report.to_json()),
                OutputFormat::Pretty => print!("{report}"),
            }
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::TestProxy(args) => {
            args.apply(&mut settings);
            let clients = ClientFactory::new(settings.outbound_settings()?);
            println!("Testing proxy connection to {CHECK_URL}");
            let report = check_upstream_proxy(&clients, CHECK_URL, CHECK_TIMEOUT).await;
            print!("{report}");
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
