//! Health-check liveness loop, layered over the frame transport.
//!
//! The server probes; the agent echoes each probe back with its sequence
//! intact and remembers when it last heard one. A watchdog task fails the
//! session with `HealthTimeout` when the probes stop arriving. Both the
//! probe cadence and the timeout can be retuned by the server-supplied
//! configuration received at registration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::dispatch::{FrameHandler, FrameSender};
use crate::error::{AgentError, FramingError};
use crate::keys::KeyStore;
use crate::messages::{
    decode_payload, FrameInfo, FrameType, HealthCheckProbe, ServerSuppliedConf,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct HealthInner {
    last_probe: Mutex<Instant>,
    interval: Mutex<Duration>,
    timeout: Mutex<Duration>,
}

/// Shared health-check state: the echo handler writes it, the watchdog
/// reads it, registration retunes it.
#[derive(Debug, Clone)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

impl HealthState {
    /// Starts the liveness clock now: the peer has a full timeout window to
    /// deliver its first probe.
    pub fn new() -> HealthState {
        HealthState {
            inner: Arc::new(HealthInner {
                last_probe: Mutex::new(Instant::now()),
                interval: Mutex::new(DEFAULT_INTERVAL),
                timeout: Mutex::new(DEFAULT_TIMEOUT),
            }),
        }
    }

    /// Applies server-directed knobs. Absent fields keep the defaults.
    pub fn apply_server_conf(&self, conf: &ServerSuppliedConf) {
        if let Some(secs) = conf.heartbeat_seconds {
            *self.inner.interval.lock() = Duration::from_secs(secs);
        }
        if let Some(secs) = conf.health_check_timeout_seconds {
            *self.inner.timeout.lock() = Duration::from_secs(secs);
        }
        debug!(
            interval = ?self.interval(),
            timeout = ?self.timeout(),
            "health-check cadence applied"
        );
    }

    pub fn record_probe(&self) {
        *self.inner.last_probe.lock() = Instant::now();
    }

    pub fn interval(&self) -> Duration {
        *self.inner.interval.lock()
    }

    pub fn timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    pub fn since_last_probe(&self) -> Duration {
        self.inner.last_probe.lock().elapsed()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::new()
    }
}

/// `HEALTH_CHECK` frame handler: echo the probe, stamp the clock.
pub struct HealthCheckHandler {
    state: HealthState,
    key_store: Arc<KeyStore>,
}

impl HealthCheckHandler {
    pub fn new(state: HealthState, key_store: Arc<KeyStore>) -> HealthCheckHandler {
        HealthCheckHandler { state, key_store }
    }
}

#[async_trait]
impl FrameHandler for HealthCheckHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::HealthCheck
    }

    async fn dispatch(&self, frame: FrameInfo, sender: &FrameSender) -> Result<(), AgentError> {
        // Registration must complete before any other frame type flows in
        // either direction; a probe arriving earlier is a protocol
        // violation, not something to answer.
        if !self.key_store.is_sealed() {
            return Err(
                FramingError::UnhandledFrameType(FrameType::HealthCheck.to_wire()).into(),
            );
        }
        // Validate before echoing so a corrupt probe fails the session
        // instead of being reflected.
        let probe: HealthCheckProbe = decode_payload(&frame.payload)?;
        self.state.record_probe();
        trace!(seq = probe.seq, "echoing health-check probe");
        sender.send(FrameType::HealthCheck, frame.payload).await
    }
}

/// Watchdog task. Wakes on the configured interval and returns the fatal
/// `HealthTimeout` once the peer has been silent past the timeout. The
/// session cancels it by dropping the task handle.
pub async fn run_watchdog(state: HealthState) -> AgentError {
    loop {
        sleep(state.interval()).await;
        let timeout = state.timeout();
        let silence = state.since_last_probe();
        if silence > timeout {
            debug!(?silence, ?timeout, "health-check watchdog tripped");
            return AgentError::HealthTimeout { timeout };
        }
    }
}
