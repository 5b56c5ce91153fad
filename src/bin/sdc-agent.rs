use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sdc::agent;
use sdc::config::LocalConf;

/// Secure Data Connector agent.
#[derive(Debug, Parser)]
#[command(name = "sdc-agent", version, about)]
struct Cli {
    /// Path to the local configuration file (TOML).
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Resource-rules file; overrides the path from the config.
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Log filter, e.g. `info` or `sdc=debug`.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    log_level: String,

    /// Tunnel server address; overrides the config.
    #[arg(long, value_name = "HOST:PORT")]
    server: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut conf = match LocalConf::load(&cli.config) {
        Ok(conf) => conf,
        Err(e) => {
            error!(kind = e.kind(), cause = %agent::error_chain(&e), "cannot load configuration");
            std::process::exit(e.exit_code());
        }
    };
    if let Some(rules) = cli.rules {
        conf.rules_file = rules;
    }
    if let Some(server) = cli.server {
        conf.tunnel_server = server;
    }
    if let Err(e) = conf.validate() {
        error!(kind = e.kind(), cause = %agent::error_chain(&e), "invalid configuration");
        std::process::exit(e.exit_code());
    }

    if let Err(e) = agent::run(Arc::new(conf)).await {
        std::process::exit(e.exit_code());
    }
}
