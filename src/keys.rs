//! Per-session resource keys and the store the SOCKS gate consults.

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A 64-bit shared secret bound to one `(host, port)` tuple, minted at
/// registration and honored only for the session that minted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub host: String,
    pub port: u16,
    pub secret: u64,
}

impl ResourceKey {
    /// Mints a key for a target. The secret doubles as an authenticator for
    /// SOCKS gating, so it always comes from the OS CSPRNG.
    pub fn mint(host: impl Into<String>, port: u16) -> ResourceKey {
        ResourceKey {
            host: host.into(),
            port,
            secret: OsRng.next_u64(),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

#[derive(Debug, Default)]
struct KeyStoreInner {
    keys: Vec<ResourceKey>,
    sealed: bool,
}

/// Holds the session's [`ResourceKey`] list and answers the membership
/// predicate the SOCKS gate enforces.
///
/// Written exactly once, by the registration handler; [`KeyStore::seal`]
/// then forbids further writes for the rest of the session. Reads after the
/// seal never contend.
#[derive(Debug, Default)]
pub struct KeyStore {
    inner: RwLock<KeyStoreInner>,
}

impl KeyStore {
    pub fn new() -> KeyStore {
        KeyStore::default()
    }

    /// Installs the minted key list. Fails once the store is sealed.
    pub fn install(&self, keys: Vec<ResourceKey>) -> Result<(), AgentError> {
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(AgentError::Config(
                "key store is sealed for this session".into(),
            ));
        }
        inner.keys = keys;
        Ok(())
    }

    /// One-shot transition to read-only.
    pub fn seal(&self) {
        self.inner.write().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    /// Membership predicate: case-insensitive ASCII host, exact port.
    pub fn is_allowed(&self, host: &str, port: u16) -> bool {
        self.inner.read().keys.iter().any(|k| k.matches(host, port))
    }

    pub fn len(&self) -> usize {
        self.inner.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().keys.is_empty()
    }

    /// `(host, port)` tuples currently installed, for logging and tests.
    pub fn targets(&self) -> Vec<(String, u16)> {
        self.inner
            .read()
            .keys
            .iter()
            .map(|k| (k.host.clone(), k.port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_match_is_ascii_case_insensitive() {
        let store = KeyStore::new();
        store
            .install(vec![ResourceKey::mint("Intranet.Example", 443)])
            .unwrap();
        assert!(store.is_allowed("intranet.example", 443));
        assert!(store.is_allowed("INTRANET.EXAMPLE", 443));
        assert!(!store.is_allowed("intranet.example", 8443));
        assert!(!store.is_allowed("other.example", 443));
    }

    #[test]
    fn sealed_store_rejects_installs() {
        let store = KeyStore::new();
        store
            .install(vec![ResourceKey::mint("localhost", 1100)])
            .unwrap();
        store.seal();
        assert!(store.is_sealed());
        assert!(store.install(vec![]).is_err());
        // Reads still work after the seal.
        assert!(store.is_allowed("localhost", 1100));
    }

    #[test]
    fn minted_secrets_differ() {
        let a = ResourceKey::mint("h", 1);
        let b = ResourceKey::mint("h", 1);
        assert_ne!(a.secret, b.secret);
    }
}
