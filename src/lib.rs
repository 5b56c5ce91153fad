//! Secure Data Connector agent (v1.0 session protocol).
//!
//! A long-lived on-premises process that dials out to a cloud tunnel
//! server over TLS, authorizes with a signed OAuth request, registers the
//! intranet resources it is allowed to expose, and then multiplexes all
//! application traffic over one outbound connection as length-prefixed
//! typed frames. A local SOCKS gate enforces that only registered
//! resources are ever proxied.

pub mod agent;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod health;
pub mod keys;
pub mod messages;
pub mod registration;
pub mod rules;
pub mod session;
pub mod socks;
pub mod transport;

pub use config::LocalConf;
pub use dispatch::{DispatchRegistry, FrameHandler, FrameSender};
pub use error::{AgentError, FramingError};
pub use framing::{FrameCodec, MAX_FRAME_LEN};
pub use keys::{KeyStore, ResourceKey};
pub use messages::{
    AuthRequest, AuthResponse, FrameInfo, FrameType, RegistrationRequest, RegistrationResponse,
    ServerSuppliedConf,
};
pub use rules::ResourceRule;
pub use session::Session;
