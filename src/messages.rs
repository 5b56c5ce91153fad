//! Wire records for the agent–server session protocol.
//!
//! The session has two wire sections. Before framing, the handshake is
//! line-oriented: the `connect v1.0` greeting, one JSON line carrying the
//! [`AuthRequest`], one JSON line carrying the [`AuthResponse`]. After
//! framing switches on, every payload rides inside a
//! `<u32 length><u32 type><payload>` frame: registration and health-check
//! records are CBOR, socket data and connection control are raw binary with
//! a leading stream id.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::keys::ResourceKey;

/// Protocol greeting written as the first line of every session.
pub const CONNECT_GREETING: &str = "connect v1.0\n";

/// Frame type discriminants carried in the second header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameType {
    Authorization = 1,
    Registration = 2,
    HealthCheck = 3,
    SocketData = 4,
    ConnectionControl = 5,
}

impl FrameType {
    pub fn from_wire(raw: u32) -> Option<FrameType> {
        match raw {
            1 => Some(FrameType::Authorization),
            2 => Some(FrameType::Registration),
            3 => Some(FrameType::HealthCheck),
            4 => Some(FrameType::SocketData),
            5 => Some(FrameType::ConnectionControl),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// One decoded frame. `seq` is stamped by the framing layer from a
/// per-direction counter; the wire carries only length, type, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    pub seq: u64,
    pub payload: Bytes,
}

/// First handshake line after the greeting: the signed OAuth query string
/// that proves the agent's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub oauth_string: String,
}

/// Server's single-line answer to the [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl AuthResponse {
    pub const STATUS_OK: &'static str = "OK";
    pub const STATUS_ACCESS_DENIED: &'static str = "ACCESS_DENIED";

    pub fn is_ok(&self) -> bool {
        self.status == Self::STATUS_OK
    }
}

/// The agent's capability surface, sent exactly once per session as the
/// payload of the outbound `REGISTRATION` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub agent_id: String,
    pub health_check_port: u16,
    pub socks_server_port: u16,
    /// Raw bytes of the rules file; the server re-parses it on its side.
    pub resource_rules: Vec<u8>,
    pub resource_keys: Vec<ResourceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_gadget_users: Option<Vec<String>>,
}

/// Server's blessing (or rejection) of the registration, received exactly
/// once per session as the payload of the inbound `REGISTRATION` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_supplied_conf: Option<ServerSuppliedConf>,
}

impl RegistrationResponse {
    pub const RESULT_OK: &'static str = "OK";
    pub const RESULT_ERROR: &'static str = "REGISTRATION_ERROR";

    pub fn is_ok(&self) -> bool {
        self.result == Self::RESULT_OK
    }
}

/// Server-directed timing knobs applied to the health check after
/// registration. Every field is optional on the wire; absent fields leave
/// the local defaults in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSuppliedConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_seconds: Option<u64>,
}

/// Payload of a `HEALTH_CHECK` frame. The agent echoes inbound probes
/// verbatim, so the `seq` the server stamped comes back to it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckProbe {
    pub seq: u64,
    pub timestamp_ms: u64,
}

/// Encodes a CBOR frame payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, AgentError> {
    let bytes = serde_cbor::to_vec(value)
        .map_err(|e| AgentError::MangledResponse(format!("payload encode: {e}")))?;
    Ok(Bytes::from(bytes))
}

/// Decodes a CBOR frame payload. Parse failures surface as
/// [`AgentError::MangledResponse`]: the peer spoke the framing layer
/// correctly but the record inside is corrupt.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, AgentError> {
    serde_cbor::from_slice(payload)
        .map_err(|e| AgentError::MangledResponse(format!("payload decode: {e}")))
}

/// Connection-control operation: half-close of one stream.
pub const CONTROL_CLOSE: u8 = 0;

/// Builds a `SOCKET_DATA` payload: `u32` stream id (big-endian) followed by
/// the raw bytes.
pub fn encode_socket_data(stream_id: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(stream_id);
    buf.put_slice(data);
    buf.freeze()
}

pub fn decode_socket_data(payload: &Bytes) -> Result<(u32, Bytes), AgentError> {
    if payload.len() < 4 {
        return Err(AgentError::MangledResponse(format!(
            "socket-data payload of {} bytes is too short for a stream id",
            payload.len()
        )));
    }
    let stream_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((stream_id, payload.slice(4..)))
}

/// Builds a `CONNECTION_CONTROL` payload: `u32` stream id, one op byte.
pub fn encode_connection_control(stream_id: u32, op: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(stream_id);
    buf.put_u8(op);
    buf.freeze()
}

pub fn decode_connection_control(payload: &[u8]) -> Result<(u32, u8), AgentError> {
    if payload.len() != 5 {
        return Err(AgentError::MangledResponse(format!(
            "connection-control payload must be 5 bytes, got {}",
            payload.len()
        )));
    }
    let stream_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((stream_id, payload[4]))
}
