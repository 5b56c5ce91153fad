//! Outbound TLS transport to the tunnel server.
//!
//! The transport owns dialing and certificate verification and exposes a
//! plain byte stream; it knows nothing about framing. The rest of the
//! session is generic over `AsyncRead + AsyncWrite`, which is what lets
//! the test suites drive it over in-memory pipes instead.

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::LocalConf;
use crate::error::AgentError;

/// Dials the configured tunnel server and completes the TLS handshake,
/// verifying the server certificate against the configured CA bundle or
/// the platform trust store.
pub async fn dial(conf: &LocalConf) -> Result<TlsStream<TcpStream>, AgentError> {
    let host = conf.tunnel_host()?.to_owned();
    let tcp = TcpStream::connect(&conf.tunnel_server)
        .await
        .map_err(|source| AgentError::Dial {
            addr: conf.tunnel_server.clone(),
            source,
        })?;

    let tls_config = client_config(conf.ca_bundle.as_deref())?;
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| AgentError::Tls(format!("invalid tls server name {host:?}")))?;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| AgentError::Tls(format!("handshake with {host}: {e}")))?;
    debug!(server = %conf.tunnel_server, "tls transport established");
    Ok(stream)
}

fn client_config(ca_bundle: Option<&Path>) -> Result<ClientConfig, AgentError> {
    let mut roots = RootCertStore::empty();
    match ca_bundle {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                AgentError::Tls(format!("cannot read ca bundle {}: {e}", path.display()))
            })?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| {
                    AgentError::Tls(format!("bad certificate in {}: {e}", path.display()))
                })?;
                roots
                    .add(cert)
                    .map_err(|e| AgentError::Tls(format!("rejected ca certificate: {e}")))?;
            }
        }
        None => {
            let loaded = rustls_native_certs::load_native_certs();
            for error in &loaded.errors {
                warn!(%error, "skipping unloadable platform root certificate");
            }
            for cert in loaded.certs {
                let _ = roots.add(cert);
            }
        }
    }
    if roots.is_empty() {
        return Err(AgentError::Tls("no trusted root certificates".into()));
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
