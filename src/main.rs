//! Kubernetes API authenticating proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use kube_auth_proxy::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check) => run_check(config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration, apply CLI overrides and validate
fn load_config(cli: &Cli) -> kube_auth_proxy::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(ref upstream) = cli.upstream {
        config.upstream.url = upstream.clone();
    }
    if let Some(ref storage) = cli.storage {
        config.storage.uri = storage.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Print the effective configuration with secrets masked
fn run_check(mut config: Config) -> ExitCode {
    if !config.oauth.secret.is_empty() {
        config.oauth.secret = "********".to_string();
    }
    if let Ok(mut uri) = url::Url::parse(&config.storage.uri)
        && uri.password().is_some()
        && uri.set_password(Some("********")).is_ok()
    {
        config.storage.uri = uri.to_string();
    }
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("{json}");
            println!("\n✅ Configuration is valid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the proxy server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        upstream = %config.upstream.url,
        "Starting kube-auth-proxy"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
