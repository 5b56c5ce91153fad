//! One session: the exclusive owner of the transport, the framing halves,
//! the key store, and every handler task for a single connection attempt.
//!
//! A session is born on dial and dies on disconnect; none of the keys,
//! stream ids, or sequence counters it minted survive into the next
//! attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::authorize;
use crate::config::SharedConf;
use crate::dispatch::{outbound_channel, DispatchRegistry, FrameSender, run_reader, run_writer};
use crate::error::AgentError;
use crate::framing::FrameCodec;
use crate::health::{run_watchdog, HealthCheckHandler, HealthState};
use crate::keys::KeyStore;
use crate::messages::AuthRequest;
use crate::registration::{send_registration_info, RegistrationHandler};
use crate::rules::ResourceRule;
use crate::socks::{run_socks_gate, ConnectionControlHandler, SocketDataHandler, StreamTable};

/// How long the server gets to answer the registration frame.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

/// A live, registered session.
pub struct Session {
    id: Uuid,
    sender: FrameSender,
    auth: AuthRequest,
    health: HealthState,
    key_store: Arc<KeyStore>,
    stream_table: Arc<StreamTable>,
    socks_addr: SocketAddr,
    reader: JoinHandle<Result<(), AgentError>>,
    writer: JoinHandle<Result<(), AgentError>>,
    watchdog: JoinHandle<AgentError>,
    socks: JoinHandle<Result<(), AgentError>>,
}

impl Session {
    /// Drives one connection attempt to the ready state: authorization over
    /// the raw stream, then framing, then the registration exchange. The
    /// SOCKS gate and health watchdog start only after the server's
    /// blessing, so no application frame can precede registration.
    pub async fn establish<S>(
        stream: S,
        conf: SharedConf,
        rules: &[ResourceRule],
        raw_rules: &[u8],
    ) -> Result<Session, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let mut stream = stream;
        let auth = authorize(&mut stream, &conf).await?;

        // The SOCKS listener binds before registration so the advertised
        // port is the port actually bound (port 0 lets the OS choose).
        let socks_listener =
            TcpListener::bind(("127.0.0.1", conf.socks_server_port)).await?;
        let socks_addr = socks_listener.local_addr()?;

        let (read_half, write_half) = tokio::io::split(stream);
        let framed_read = FramedRead::new(read_half, FrameCodec::new());
        let framed_write = FramedWrite::new(write_half, FrameCodec::new());

        let (sender, outbound_rx) = outbound_channel();
        let key_store = Arc::new(KeyStore::new());
        let health = HealthState::new();
        let stream_table = Arc::new(StreamTable::new());
        let (ready_tx, mut ready_rx) = oneshot::channel();

        // Every handler except registration refuses frames until the key
        // store seals, so inbound traffic cannot precede the server's
        // registration acknowledgement.
        let mut registry = DispatchRegistry::new();
        registry.register(Arc::new(RegistrationHandler::new(
            key_store.clone(),
            health.clone(),
            ready_tx,
        )));
        registry.register(Arc::new(HealthCheckHandler::new(
            health.clone(),
            key_store.clone(),
        )));
        registry.register(Arc::new(SocketDataHandler::new(
            stream_table.clone(),
            key_store.clone(),
        )));
        registry.register(Arc::new(ConnectionControlHandler::new(
            stream_table.clone(),
            key_store.clone(),
        )));

        let writer = tokio::spawn(run_writer(framed_write, outbound_rx));
        let mut reader = tokio::spawn(run_reader(framed_read, registry, sender.clone()));

        if let Err(e) =
            send_registration_info(&sender, &conf, socks_addr.port(), rules, raw_rules, &key_store)
                .await
        {
            reader.abort();
            writer.abort();
            return Err(e);
        }

        let readiness = timeout(REGISTRATION_TIMEOUT, async {
            tokio::select! {
                res = &mut ready_rx => match res {
                    Ok(()) => Ok(()),
                    // The registry dropped the ready sender: the reader is
                    // finishing with the real cause. Collect it.
                    Err(_) => Err(reader_outcome((&mut reader).await)),
                },
                join = &mut reader => Err(reader_outcome(join)),
            }
        })
        .await;

        match readiness {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                reader.abort();
                writer.abort();
                return Err(e);
            }
            Err(_) => {
                reader.abort();
                writer.abort();
                return Err(AgentError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "tunnel server did not answer registration",
                )));
            }
        }

        let watchdog = tokio::spawn(run_watchdog(health.clone()));
        let socks = tokio::spawn(run_socks_gate(
            socks_listener,
            key_store.clone(),
            stream_table.clone(),
            sender.clone(),
        ));

        info!(session = %id, socks = %socks_addr, "session ready");
        Ok(Session {
            id,
            sender,
            auth,
            health,
            key_store,
            stream_table,
            socks_addr,
            reader,
            writer,
            watchdog,
            socks,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The signed request that opened this session, kept as registration
    /// context.
    pub fn auth_context(&self) -> &AuthRequest {
        &self.auth
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    /// Live health-check state, retunable by the server at registration.
    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn sender(&self) -> &FrameSender {
        &self.sender
    }

    /// Where the SOCKS gate actually listens.
    pub fn socks_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    /// Blocks until something ends the session and returns the failure.
    /// Closing is the single cancellation primitive: the first task to fail
    /// brings every other one down through [`Session::shutdown`].
    pub async fn run_until_failure(&mut self) -> AgentError {
        let err = tokio::select! {
            join = &mut self.reader => reader_outcome(join),
            join = &mut self.writer => match join {
                Ok(Ok(())) => AgentError::PeerClosed,
                Ok(Err(e)) => e,
                Err(e) => join_failure(e),
            },
            join = &mut self.watchdog => match join {
                Ok(err) => err,
                Err(e) => join_failure(e),
            },
            join = &mut self.socks => match join {
                Ok(Ok(())) => AgentError::PeerClosed,
                Ok(Err(e)) => e,
                Err(e) => join_failure(e),
            },
        };
        self.shutdown();
        err
    }

    /// Tears the session down: every task is aborted, the framed halves are
    /// dropped (closing the transport), and per-stream pumps observe their
    /// queues closing and exit.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
        self.watchdog.abort();
        self.socks.abort();
        self.stream_table.close_all();
        debug!(session = %self.id, "session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_outcome(join: Result<Result<(), AgentError>, JoinError>) -> AgentError {
    match join {
        // The reader only returns through a failure; a clean exit still
        // means the inbound side is gone.
        Ok(Ok(())) => AgentError::PeerClosed,
        Ok(Err(e)) => e,
        Err(e) => join_failure(e),
    }
}

fn join_failure(e: JoinError) -> AgentError {
    AgentError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}
