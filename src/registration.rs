//! Registration: advertise the agent's capability surface, receive the
//! server's blessing, and install the session's resource keys.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::LocalConf;
use crate::dispatch::{FrameHandler, FrameSender};
use crate::error::AgentError;
use crate::health::HealthState;
use crate::keys::{KeyStore, ResourceKey};
use crate::messages::{
    decode_payload, encode_payload, FrameInfo, FrameType, RegistrationRequest,
    RegistrationResponse,
};
use crate::rules::ResourceRule;

/// Host the health-check endpoint's key is bound to.
pub const HEALTH_CHECK_HOST: &str = "localhost";

/// Mints one key per rule URL plus the extra key for the local
/// health-check endpoint. A rules file with zero URLs therefore still
/// yields exactly one key.
pub fn mint_resource_keys(rules: &[ResourceRule], health_check_port: u16) -> Vec<ResourceKey> {
    let mut keys: Vec<ResourceKey> = rules
        .iter()
        .map(|rule| ResourceKey::mint(rule.host.clone(), rule.port))
        .collect();
    keys.push(ResourceKey::mint(HEALTH_CHECK_HOST, health_check_port));
    keys
}

/// Splits the comma-separated gadget-user option. Entries are trimmed and
/// empties skipped; an absent or whitespace-only option yields `None`, not
/// an empty list.
pub fn parse_gadget_users(raw: Option<&str>) -> Option<Vec<String>> {
    let users: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if users.is_empty() {
        None
    } else {
        Some(users)
    }
}

/// Builds and submits the session's single outbound `REGISTRATION` frame,
/// then persists the minted keys into the key store. The store stays
/// unsealed until the server acknowledges.
pub async fn send_registration_info(
    sender: &FrameSender,
    conf: &LocalConf,
    socks_port: u16,
    rules: &[ResourceRule],
    raw_rules: &[u8],
    key_store: &KeyStore,
) -> Result<(), AgentError> {
    let keys = mint_resource_keys(rules, conf.health_check_port);
    let request = RegistrationRequest {
        agent_id: conf.agent_id.clone(),
        health_check_port: conf.health_check_port,
        socks_server_port: socks_port,
        resource_rules: raw_rules.to_vec(),
        resource_keys: keys.clone(),
        health_check_gadget_users: parse_gadget_users(
            conf.health_check_gadget_users.as_deref(),
        ),
    };
    let payload = encode_payload(&request)?;
    sender.send(FrameType::Registration, payload).await?;
    key_store.install(keys)?;
    debug!(
        resources = rules.len(),
        keys = key_store.len(),
        "registration submitted"
    );
    Ok(())
}

/// Handler for the session's single inbound `REGISTRATION` frame.
pub struct RegistrationHandler {
    key_store: Arc<KeyStore>,
    health: HealthState,
    ready: Mutex<Option<oneshot::Sender<()>>>,
}

impl RegistrationHandler {
    pub fn new(
        key_store: Arc<KeyStore>,
        health: HealthState,
        ready: oneshot::Sender<()>,
    ) -> RegistrationHandler {
        RegistrationHandler {
            key_store,
            health,
            ready: Mutex::new(Some(ready)),
        }
    }
}

#[async_trait]
impl FrameHandler for RegistrationHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::Registration
    }

    async fn dispatch(&self, frame: FrameInfo, _sender: &FrameSender) -> Result<(), AgentError> {
        let response: RegistrationResponse = decode_payload(&frame.payload)?;
        if !response.is_ok() {
            return Err(AgentError::Registration {
                status_message: response
                    .status_message
                    .unwrap_or_else(|| response.result.clone()),
            });
        }

        let ready = self.ready.lock().take().ok_or_else(|| {
            AgentError::MangledResponse("duplicate registration response".into())
        })?;

        if let Some(conf) = response.server_supplied_conf.as_ref() {
            self.health.apply_server_conf(conf);
        }
        self.key_store.seal();
        info!(keys = self.key_store.len(), "registration acknowledged");
        // The session may already be tearing down; a dropped receiver is
        // not this handler's failure.
        let _ = ready.send(());
        Ok(())
    }
}
