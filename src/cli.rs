//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authenticating reverse proxy for the Kubernetes API
#[derive(Parser, Debug)]
#[command(name = "kube-auth-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KUBE_AUTH_PROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "KUBE_AUTH_PROXY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "KUBE_AUTH_PROXY_HOST")]
    pub host: Option<String>,

    /// Upstream API server URL
    #[arg(long, env = "KUBE_AUTH_PROXY_UPSTREAM_URL")]
    pub upstream: Option<String>,

    /// Token storage URI (`memory:`, `redis://…`)
    #[arg(long, env = "KUBE_AUTH_PROXY_STORAGE_URI")]
    pub storage: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KUBE_AUTH_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KUBE_AUTH_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (default)
    Serve,

    /// Load and validate the configuration, then print it
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::try_parse_from([
            "kube-auth-proxy",
            "--port",
            "9090",
            "--storage",
            "redis://cache:6379/0",
            "check",
        ])
        .unwrap();

        assert_eq!(cli.port, Some(9090));
        assert_eq!(cli.storage.as_deref(), Some("redis://cache:6379/0"));
        assert!(matches!(cli.command, Some(Command::Check)));
    }
}
