//! Local agent configuration, loaded once at startup and immutable after.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::AgentError;

/// Consecutive-failure budget applied when the config does not set one.
pub const DEFAULT_RECONNECT_BUDGET: u32 = 8;

/// The agent's local configuration file (TOML).
///
/// `user` and `domain` combine into the agent's email identity; `domain`
/// doubles as the OAuth consumer key. The rules file referenced here is
/// parsed separately (see [`crate::rules`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConf {
    pub agent_id: String,
    pub user: String,
    pub domain: String,
    pub oauth_consumer_secret: String,
    /// `host:port` of the cloud tunnel server.
    pub tunnel_server: String,
    pub rules_file: PathBuf,
    /// Port for the local SOCKS gate; 0 lets the OS choose and the actual
    /// port is the one advertised at registration.
    pub socks_server_port: u16,
    pub health_check_port: u16,
    /// Comma-separated identities allowed to view this agent's liveness
    /// state in the server UI. Whitespace-only means none.
    #[serde(default)]
    pub health_check_gadget_users: Option<String>,
    /// PEM bundle to trust instead of the platform roots.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    /// Consecutive session failures tolerated before giving up.
    #[serde(default)]
    pub reconnect_budget: Option<u32>,
    /// Command (argv) for the bundled SSH port-forwarder; the SOCKS port is
    /// appended as the final argument.
    #[serde(default)]
    pub ssh_forwarder: Option<Vec<String>>,
}

impl LocalConf {
    pub fn load(path: &Path) -> Result<LocalConf, AgentError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let conf: LocalConf = toml::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("cannot parse {}: {e}", path.display())))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.agent_id.trim().is_empty() {
            return Err(AgentError::Config("agent_id must not be empty".into()));
        }
        if self.user.trim().is_empty() || self.domain.trim().is_empty() {
            return Err(AgentError::Config(
                "user and domain must both be set".into(),
            ));
        }
        if self.tunnel_server.trim().is_empty() {
            return Err(AgentError::Config("tunnel_server must not be empty".into()));
        }
        if self.health_check_port == 0 {
            return Err(AgentError::Config(
                "health_check_port must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The identity the agent authorizes as.
    pub fn email(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }

    /// Tunnel-server host without the port, used for TLS server-name
    /// verification.
    pub fn tunnel_host(&self) -> Result<&str, AgentError> {
        match self.tunnel_server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(host),
            _ => Err(AgentError::Config(format!(
                "tunnel_server must be host:port, got {:?}",
                self.tunnel_server
            ))),
        }
    }

    pub fn reconnect_budget(&self) -> u32 {
        self.reconnect_budget.unwrap_or(DEFAULT_RECONNECT_BUDGET)
    }
}

pub type SharedConf = Arc<LocalConf>;
