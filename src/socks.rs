//! Local SOCKS5 gate: the policy chokepoint between the bundled SSH
//! forwarder and the tunnel.
//!
//! Every CONNECT is checked against the session's sealed key store before
//! any byte crosses the tunnel. Approved connections are bridged as
//! `SOCKET_DATA` frames tagged with a locally minted 32-bit stream id;
//! `CONNECTION_CONTROL` close records carry half-close (EOF) per stream
//! without tearing the peer down.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dispatch::{FrameHandler, FrameSender};
use crate::error::{AgentError, FramingError};
use crate::keys::KeyStore;
use crate::messages::{
    decode_connection_control, decode_socket_data, encode_connection_control, encode_socket_data,
    FrameInfo, FrameType, CONTROL_CLOSE,
};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Per-stream delivery queue depth. A slow local socket backpressures its
/// own stream through here rather than growing without bound.
const STREAM_QUEUE_DEPTH: usize = 32;

const READ_CHUNK: usize = 16 * 1024;

/// Inbound event for one bridged stream.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Bytes),
    Eof,
}

/// Live bridged streams, keyed by the locally minted id. The id space is
/// per-session; ids are never reused within one.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: Mutex<HashMap<u32, mpsc::Sender<StreamEvent>>>,
    next_id: AtomicU32,
}

impl StreamTable {
    pub fn new() -> StreamTable {
        StreamTable::default()
    }

    /// Mints the next stream id and registers its delivery queue.
    pub fn register(&self) -> (u32, mpsc::Receiver<StreamEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        self.streams.lock().insert(id, tx);
        (id, rx)
    }

    pub fn remove(&self, id: u32) {
        self.streams.lock().remove(&id);
    }

    /// Routes inbound data to its stream. Data for an unknown id is
    /// dropped: a frame racing a local close is normal after half-close.
    pub async fn route_data(&self, id: u32, data: Bytes) {
        let tx = self.streams.lock().get(&id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(StreamEvent::Data(data)).await.is_err() {
                    self.remove(id);
                }
            }
            None => warn!(stream_id = id, "dropping socket data for unknown stream"),
        }
    }

    /// Delivers the peer's EOF and retires the id from the table.
    pub async fn route_eof(&self, id: u32) {
        let tx = self.streams.lock().remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(StreamEvent::Eof).await;
            }
            None => warn!(stream_id = id, "connection-control close for unknown stream"),
        }
    }

    /// Drops every delivery queue so per-stream pumps observe the session's
    /// end and exit.
    pub fn close_all(&self) {
        self.streams.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

/// `SOCKET_DATA` frame handler: route by stream id.
pub struct SocketDataHandler {
    table: Arc<StreamTable>,
    key_store: Arc<KeyStore>,
}

impl SocketDataHandler {
    pub fn new(table: Arc<StreamTable>, key_store: Arc<KeyStore>) -> SocketDataHandler {
        SocketDataHandler { table, key_store }
    }
}

#[async_trait]
impl FrameHandler for SocketDataHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::SocketData
    }

    async fn dispatch(&self, frame: FrameInfo, _sender: &FrameSender) -> Result<(), AgentError> {
        // No stream can exist before registration is acknowledged; data
        // arriving earlier is a protocol violation.
        if !self.key_store.is_sealed() {
            return Err(
                FramingError::UnhandledFrameType(FrameType::SocketData.to_wire()).into(),
            );
        }
        let (stream_id, data) = decode_socket_data(&frame.payload)?;
        self.table.route_data(stream_id, data).await;
        Ok(())
    }
}

/// `CONNECTION_CONTROL` frame handler: currently only half-close.
pub struct ConnectionControlHandler {
    table: Arc<StreamTable>,
    key_store: Arc<KeyStore>,
}

impl ConnectionControlHandler {
    pub fn new(
        table: Arc<StreamTable>,
        key_store: Arc<KeyStore>,
    ) -> ConnectionControlHandler {
        ConnectionControlHandler { table, key_store }
    }
}

#[async_trait]
impl FrameHandler for ConnectionControlHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::ConnectionControl
    }

    async fn dispatch(&self, frame: FrameInfo, _sender: &FrameSender) -> Result<(), AgentError> {
        if !self.key_store.is_sealed() {
            return Err(FramingError::UnhandledFrameType(
                FrameType::ConnectionControl.to_wire(),
            )
            .into());
        }
        let (stream_id, op) = decode_connection_control(&frame.payload)?;
        match op {
            CONTROL_CLOSE => self.table.route_eof(stream_id).await,
            other => warn!(stream_id, op = other, "unknown connection-control op"),
        }
        Ok(())
    }
}

/// Accept loop for the local SOCKS5 listener. Runs until the listener
/// fails or the session aborts the task.
///
/// Per-connection pumps live in the accept loop's `JoinSet`, so aborting
/// this task aborts every pump with it; no pump outlives its session.
pub async fn run_socks_gate(
    listener: TcpListener,
    key_store: Arc<KeyStore>,
    table: Arc<StreamTable>,
    sender: FrameSender,
) -> Result<(), AgentError> {
    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                debug!(%peer, "socks connection accepted");
                let key_store = key_store.clone();
                let table = table.clone();
                let sender = sender.clone();
                connections.spawn(async move {
                    if let Err(e) = serve_connection(socket, key_store, table, sender).await {
                        debug!(%peer, error = %e, "socks connection ended with error");
                    }
                });
            }
            // Reap finished pumps so the set stays bounded by the number
            // of live connections.
            Some(_) = connections.join_next() => {}
        }
    }
}

/// The CONNECT target as parsed from the SOCKS request.
#[derive(Debug, PartialEq, Eq)]
struct ConnectTarget {
    host: String,
    port: u16,
}

async fn serve_connection(
    mut socket: TcpStream,
    key_store: Arc<KeyStore>,
    table: Arc<StreamTable>,
    sender: FrameSender,
) -> Result<(), AgentError> {
    if !negotiate_method(&mut socket).await? {
        return Ok(());
    }

    let target = match read_connect_request(&mut socket).await? {
        Ok(target) => target,
        Err(reply_code) => {
            send_reply(&mut socket, reply_code).await?;
            return Ok(());
        }
    };

    if !key_store.is_allowed(&target.host, target.port) {
        info!(host = %target.host, port = target.port, "socks connect refused by ruleset");
        send_reply(&mut socket, REPLY_NOT_ALLOWED).await?;
        return Ok(());
    }

    let (stream_id, events) = table.register();
    send_reply(&mut socket, REPLY_SUCCEEDED).await?;
    info!(host = %target.host, port = target.port, stream_id, "socks stream opened");

    let (read_half, write_half) = socket.into_split();
    let uplink = pump_uplink(read_half, stream_id, sender.clone());
    let downlink = pump_downlink(write_half, events);
    let _ = tokio::join!(uplink, downlink);
    table.remove(stream_id);
    debug!(stream_id, "socks stream closed");
    Ok(())
}

/// Method negotiation: only `NO AUTHENTICATION REQUIRED` is offered to the
/// bundled forwarder. Returns false when no acceptable method was offered.
async fn negotiate_method(socket: &mut TcpStream) -> Result<bool, AgentError> {
    let version = socket.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(AgentError::MangledResponse(format!(
            "socks version {version}, expected 5"
        )));
    }
    let method_count = socket.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        socket
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Ok(false);
    }
    socket.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(true)
}

/// Reads the request and extracts the CONNECT target. A refusal reply code
/// comes back in `Err` for requests this gate does not serve.
async fn read_connect_request(
    socket: &mut TcpStream,
) -> Result<Result<ConnectTarget, u8>, AgentError> {
    let mut head = [0u8; 4];
    socket.read_exact(&mut head).await?;
    let [version, command, _reserved, address_type] = head;
    if version != SOCKS_VERSION {
        return Ok(Err(REPLY_GENERAL_FAILURE));
    }

    let host = match address_type {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            socket.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = socket.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            socket.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) => name,
                Err(_) => return Ok(Err(REPLY_GENERAL_FAILURE)),
            }
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            socket.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => return Ok(Err(REPLY_ADDRESS_NOT_SUPPORTED)),
    };
    let port = socket.read_u16().await?;

    if command != CMD_CONNECT {
        return Ok(Err(REPLY_COMMAND_NOT_SUPPORTED));
    }
    Ok(Ok(ConnectTarget { host, port }))
}

async fn send_reply(socket: &mut TcpStream, code: u8) -> Result<(), AgentError> {
    // Bind address is not meaningful for a tunneled stream; all-zero IPv4.
    let reply = [SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    socket.write_all(&reply).await?;
    Ok(())
}

/// Local socket → tunnel. Local EOF becomes a half-close control frame;
/// the downlink keeps running until the peer closes its side.
async fn pump_uplink(mut read_half: OwnedReadHalf, stream_id: u32, sender: FrameSender) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let _ = sender
                    .send(
                        FrameType::ConnectionControl,
                        encode_connection_control(stream_id, CONTROL_CLOSE),
                    )
                    .await;
                break;
            }
            Ok(n) => {
                if sender
                    .send(FrameType::SocketData, encode_socket_data(stream_id, &buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!(stream_id, error = %e, "socks uplink read failed");
                let _ = sender
                    .send(
                        FrameType::ConnectionControl,
                        encode_connection_control(stream_id, CONTROL_CLOSE),
                    )
                    .await;
                break;
            }
        }
    }
}

/// Tunnel → local socket. Within one stream id, frames arrive here in
/// submission order; `Eof` shuts down the write side only.
async fn pump_downlink(mut write_half: OwnedWriteHalf, mut events: mpsc::Receiver<StreamEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(data) => {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            StreamEvent::Eof => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}
