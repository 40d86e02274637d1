use anyhow::{bail, Result};
use clap::builder::FalseyValueParser;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backoff;
mod body;
mod config;
mod delegate;
mod duplex;
mod polling;
mod proxy;
mod registry;
mod remote;
mod supervisor;
mod transport;

use config::{AgentConfig, Overrides};
use supervisor::ConnectionSupervisor;

#[derive(Parser)]
#[command(name = "backhaul")]
#[command(author = "Backhaul Team")]
#[command(version)]
#[command(about = "Local agent of a reverse HTTP tunnel", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./backhaul.yml, then ~/backhaul.yml)
    #[arg(short, long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Connection list as a JSON array; replaces the list of the config file
    #[arg(long, env = "CONNECTION_INFO_LIST", hide_env_values = true)]
    connections: Option<String>,

    /// Timeout of each backend call
    #[arg(long, env = "REQUEST_TIMEOUT_MILLIS")]
    request_timeout_millis: Option<u64>,

    /// Maximum concurrent discovery calls per polling connection
    #[arg(long, env = "MAX_LONG_POLLING_CONNECTION_COUNT")]
    max_concurrency: Option<usize>,

    #[arg(long, env = "REQUEST_HEADERS_PATH")]
    request_headers_path: Option<String>,

    #[arg(long, env = "REQUEST_BODY_PATH")]
    request_body_path: Option<String>,

    #[arg(long, env = "RESPONSE_HEADERS_PATH")]
    response_headers_path: Option<String>,

    #[arg(long, env = "RESPONSE_BODY_PATH")]
    response_body_path: Option<String>,

    #[arg(long, env = "TRANSFER_ERROR_PATH")]
    transfer_error_path: Option<String>,

    #[arg(long, env = "WEB_SOCKET_PATH")]
    web_socket_path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "DEBUG", value_parser = FalseyValueParser::new())]
    verbose: bool,

    /// Leave timestamps out of log lines (e.g. when the log sink adds its own)
    #[arg(long, env = "OMIT_LOG_TIMESTAMP", value_parser = FalseyValueParser::new())]
    omit_log_timestamp: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            request_timeout_millis: self.request_timeout_millis,
            max_concurrency: self.max_concurrency,
            request_headers_path: self.request_headers_path.clone(),
            request_body_path: self.request_body_path.clone(),
            response_headers_path: self.response_headers_path.clone(),
            response_body_path: self.response_body_path.clone(),
            transfer_error_path: self.transfer_error_path.clone(),
            web_socket_path: self.web_socket_path.clone(),
        }
    }
}

fn init_logging(verbose: bool, omit_timestamp: bool) {
    let default_filter = if verbose { "backhaul=debug,backhaul_shared=debug" } else { "backhaul=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if omit_timestamp {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.omit_log_timestamp);

    let mut config = match cli.config.clone().or_else(AgentConfig::find_config) {
        Some(path) => {
            info!("Using config: {}", path.display());
            AgentConfig::load(&path)?
        }
        None => AgentConfig::default(),
    };
    if let Some(json) = &cli.connections {
        config.set_connections_json(json)?;
    }
    config.apply_overrides(&cli.overrides());

    if config.connections.is_empty() {
        bail!("no backend connections configured; set CONNECTION_INFO_LIST or create backhaul.yml");
    }

    let mut supervisor = ConnectionSupervisor::new(config.resolve());
    supervisor.start_all();
    supervisor.wait_for_shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "backhaul",
            "--request-timeout-millis",
            "2500",
            "--web-socket-path",
            "/tunnel",
            "-v",
        ]);
        assert!(cli.verbose);
        let overrides = cli.overrides();
        assert_eq!(overrides.request_timeout_millis, Some(2500));
        assert_eq!(overrides.web_socket_path.as_deref(), Some("/tunnel"));
        assert_eq!(overrides.max_concurrency, None);
    }
}
