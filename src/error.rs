use std::time::Duration;

use thiserror::Error;

use crate::messages::FrameType;

/// Errors raised while reading or writing the framed section of the tunnel.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The peer closed the connection between frames.
    #[error("tunnel connection closed")]
    Eof,
    /// The peer closed the connection in the middle of a frame.
    #[error("tunnel connection closed mid-frame")]
    ShortRead,
    #[error("frame length {length} exceeds session maximum {max}")]
    OversizedFrame { length: u32, max: u32 },
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("no handler registered for frame type {0}")]
    UnhandledFrameType(u32),
    #[error("handler for {frame_type:?} frames failed")]
    Dispatch {
        frame_type: FrameType,
        #[source]
        source: Box<AgentError>,
    },
    #[error("frame i/o failed")]
    Io(#[from] std::io::Error),
}

/// Crate-wide error taxonomy.
///
/// Each variant carries enough context for the single structured failure
/// event the supervisor logs per session. Recoverability is a property of
/// the variant: recoverable failures trigger reconnect with backoff,
/// terminal ones map to a process exit code.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to dial tunnel server {addr}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("tunnel server closed the connection")]
    PeerClosed,
    #[error("authorization rejected for {email}: {status}")]
    Authentication { email: String, status: String },
    /// Protocol-level corruption in a peer response. The `Display` output
    /// always begins with the literal `Mangled`; log scrapers match on it.
    #[error("Mangled tunnel-server response: {0}")]
    MangledResponse(String),
    #[error("registration rejected by tunnel server: {status_message}")]
    Registration { status_message: String },
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("no health-check probe received within {timeout:?}")]
    HealthTimeout { timeout: Duration },
    #[error("resource rule url {url} rejected: {reason}")]
    ResourceUrl { url: String, reason: String },
    #[error("i/o failure")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Follows `Framing::Dispatch` wrapping down to the error a handler
    /// actually returned. Handlers convert local failures into the framing
    /// failure mode so the reader can tear the session down uniformly, but
    /// recoverability and exit codes are decided by the root cause.
    pub fn root(&self) -> &AgentError {
        match self {
            AgentError::Framing(FramingError::Dispatch { source, .. }) => source.root(),
            other => other,
        }
    }

    /// Whether the reconnect supervisor should retry after this failure.
    pub fn is_recoverable(&self) -> bool {
        match self.root() {
            AgentError::Config(_)
            | AgentError::Authentication { .. }
            | AgentError::Registration { .. }
            | AgentError::ResourceUrl { .. } => false,
            AgentError::Dial { .. }
            | AgentError::Tls(_)
            | AgentError::PeerClosed
            | AgentError::MangledResponse(_)
            | AgentError::Framing(_)
            | AgentError::HealthTimeout { .. }
            | AgentError::Io(_) => true,
        }
    }

    /// Process exit code for a failure the supervisor gave up on.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            AgentError::Config(_) | AgentError::ResourceUrl { .. } => 1,
            AgentError::Authentication { .. } => 2,
            AgentError::Registration { .. } => 3,
            _ => 4,
        }
    }

    /// Short stable kind tag used in the per-failure log event.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            AgentError::Config(_) => "config",
            AgentError::Dial { .. } => "dial",
            AgentError::Tls(_) => "tls",
            AgentError::PeerClosed => "peer-closed",
            AgentError::Authentication { .. } => "authentication",
            AgentError::MangledResponse(_) => "mangled-response",
            AgentError::Registration { .. } => "registration",
            AgentError::Framing(_) => "framing",
            AgentError::HealthTimeout { .. } => "health-timeout",
            AgentError::ResourceUrl { .. } => "resource-url",
            AgentError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangled_display_prefix_is_stable() {
        let err = AgentError::MangledResponse("SO NOT A REAL JSON STRING".into());
        assert!(err.to_string().starts_with("Mangled"));
    }

    #[test]
    fn dispatch_wrapping_preserves_root_cause() {
        let err = AgentError::Framing(FramingError::Dispatch {
            frame_type: FrameType::Registration,
            source: Box::new(AgentError::Registration {
                status_message: "quota exceeded".into(),
            }),
        });
        assert!(!err.is_recoverable());
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.kind(), "registration");
    }

    #[test]
    fn framing_failures_are_recoverable() {
        let err = AgentError::Framing(FramingError::OversizedFrame {
            length: 9_000_000,
            max: 1_048_576,
        });
        assert!(err.is_recoverable());
        assert_eq!(err.exit_code(), 4);
    }
}
