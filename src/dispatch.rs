//! Frame dispatch: one reader routes inbound frames to registered
//! handlers; one writer arbiter serializes all outbound frames.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::error::{AgentError, FramingError};
use crate::framing::FrameCodec;
use crate::messages::{FrameInfo, FrameType};

/// Depth of the writer arbiter's queue. Senders block (backpressure) when
/// the writer falls behind; the queue is never unbounded.
pub const WRITER_QUEUE_DEPTH: usize = 64;

/// An outbound frame waiting for the writer arbiter.
#[derive(Debug)]
pub struct OutboundFrame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

/// Cloneable capability for submitting outbound frames. Handlers hold one
/// of these; none of them owns the writer.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl FrameSender {
    /// Queues one frame. Atomicity with respect to other senders is
    /// guaranteed by the writer arbiter, not here.
    pub async fn send(&self, frame_type: FrameType, payload: Bytes) -> Result<(), AgentError> {
        self.tx
            .send(OutboundFrame {
                frame_type,
                payload,
            })
            .await
            .map_err(|_| AgentError::PeerClosed)
    }
}

/// Creates the writer arbiter's queue.
pub fn outbound_channel() -> (FrameSender, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    (FrameSender { tx }, rx)
}

/// A handler for one frame type. Handlers must not block the reader: they
/// either finish quickly or hand work to their own task.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    fn frame_type(&self) -> FrameType;

    async fn dispatch(&self, frame: FrameInfo, sender: &FrameSender) -> Result<(), AgentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Registered,
    Active,
    Closed,
}

struct HandlerEntry {
    handler: Arc<dyn FrameHandler>,
    state: HandlerState,
}

/// Maps each frame type to its registered handler and tracks handler
/// lifecycle for the session.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<FrameType, HandlerEntry>,
}

impl DispatchRegistry {
    pub fn new() -> DispatchRegistry {
        DispatchRegistry::default()
    }

    /// Registers a handler for its frame type. Registering the same type
    /// twice replaces the earlier handler.
    pub fn register(&mut self, handler: Arc<dyn FrameHandler>) {
        let frame_type = handler.frame_type();
        self.handlers.insert(
            frame_type,
            HandlerEntry {
                handler,
                state: HandlerState::Registered,
            },
        );
    }

    pub fn is_registered(&self, frame_type: FrameType) -> bool {
        self.handlers.contains_key(&frame_type)
    }

    /// Routes one frame. A frame for an unregistered type is a protocol
    /// violation that tears the session down; handler failures are wrapped
    /// so the reader can tear down uniformly while the root cause survives
    /// for exit-code mapping.
    pub async fn dispatch(
        &mut self,
        frame: FrameInfo,
        sender: &FrameSender,
    ) -> Result<(), AgentError> {
        let frame_type = frame.frame_type;
        let entry = self
            .handlers
            .get_mut(&frame_type)
            .ok_or(FramingError::UnhandledFrameType(frame_type.to_wire()))?;
        if entry.state == HandlerState::Closed {
            return Err(FramingError::UnhandledFrameType(frame_type.to_wire()).into());
        }
        entry.state = HandlerState::Active;
        trace!(?frame_type, seq = frame.seq, len = frame.payload.len(), "dispatching frame");
        entry
            .handler
            .dispatch(frame, sender)
            .await
            .map_err(|e| FramingError::Dispatch {
                frame_type,
                source: Box::new(e),
            })?;
        Ok(())
    }

    pub fn close_all(&mut self) {
        for entry in self.handlers.values_mut() {
            entry.state = HandlerState::Closed;
        }
    }
}

/// The single reader: drains the framed inbound side and routes every
/// frame. Returns the failure that ended the session; a clean peer close
/// surfaces as [`FramingError::Eof`].
pub async fn run_reader<R>(
    mut frames: FramedRead<R, FrameCodec>,
    mut registry: DispatchRegistry,
    sender: FrameSender,
) -> Result<(), AgentError>
where
    R: AsyncRead + Unpin + Send,
{
    let result = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                if let Err(e) = registry.dispatch(frame, &sender).await {
                    break Err(e);
                }
            }
            Some(Err(e)) => break Err(AgentError::Framing(e)),
            None => break Err(AgentError::Framing(FramingError::Eof)),
        }
    };
    registry.close_all();
    debug!("frame reader stopped");
    result
}

/// The single writer arbiter: owns the framed outbound side and serializes
/// every frame, so no two senders can interleave bytes on the wire. Drains
/// the queue and stops when every sender is gone.
pub async fn run_writer<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<OutboundFrame>,
) -> Result<(), AgentError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut seq: u64 = 0;
    while let Some(out) = rx.recv().await {
        trace!(frame_type = ?out.frame_type, seq, len = out.payload.len(), "writing frame");
        sink.send((out.frame_type, out.payload)).await?;
        seq += 1;
    }
    debug!(frames = seq, "frame writer drained and stopped");
    Ok(())
}
