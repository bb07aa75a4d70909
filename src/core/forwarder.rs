//! Bridges a run's bus events to a transport.
//!
//! The forwarder subscribes before its task starts, so no event published
//! after `spawn` returns can be missed. Its owner must either `join` it once
//! the run is finished or `cancel` it; dropping it aborts the task.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{RunId, StageEvent};

use super::event_bus::EventBus;

/// Message type tag carried by every forwarded event
pub const TRACE_MESSAGE_TYPE: &str = "trace_event";

/// Wire form of a stage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub event: StageEvent,

    /// Conversation the run belongs to, if the host tracks one
    pub conversation_id: Option<String>,
}

impl TraceMessage {
    pub fn new(event: &StageEvent, conversation_id: Option<String>) -> Self {
        Self {
            kind: TRACE_MESSAGE_TYPE.to_string(),
            event: event.clone(),
            conversation_id,
        }
    }

    /// One JSON document followed by a newline
    pub fn json_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }

    /// Server-sent events frame
    pub fn sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Errors raised by a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink closed")]
    Closed,
}

/// Destination for forwarded messages
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, message: &TraceMessage) -> Result<(), SinkError>;
}

/// How a [`WriterSink`] frames each message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    JsonLines,
    Sse,
}

/// Writes framed messages to any async writer
pub struct WriterSink<W> {
    writer: W,
    framing: Framing,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &TraceMessage) -> Result<(), SinkError> {
        let frame = match self.framing {
            Framing::JsonLines => message.json_line()?,
            Framing::Sse => message.sse_frame()?,
        };
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Hands messages to an in-process channel
pub struct ChannelSink {
    tx: UnboundedSender<TraceMessage>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<TraceMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, message: &TraceMessage) -> Result<(), SinkError> {
        self.tx.send(message.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Owned background task forwarding one run's events to a sink
pub struct EventForwarder {
    run_id: RunId,
    handle: Option<JoinHandle<usize>>,
}

impl EventForwarder {
    /// Subscribe to `run_id` and start forwarding to `sink`
    pub fn spawn<S>(bus: &EventBus, run_id: &RunId, mut sink: S, conversation_id: Option<String>) -> Self
    where
        S: EventSink + 'static,
    {
        let mut subscription = bus.attach(run_id);
        let task_run_id = run_id.clone();

        let handle = tokio::spawn(async move {
            let mut forwarded = 0usize;
            while let Some(event) = subscription.next().await {
                let message = TraceMessage::new(&event, conversation_id.clone());
                if let Err(e) = sink.send(&message).await {
                    warn!(run_id = %task_run_id, error = %e, "forwarding stopped");
                    break;
                }
                forwarded += 1;
            }
            debug!(run_id = %task_run_id, forwarded, "forwarder finished");
            forwarded
        });

        Self {
            run_id: run_id.clone(),
            handle: Some(handle),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Wait until the run's sentinel (or a sink failure) ends forwarding.
    ///
    /// Returns the number of events forwarded.
    pub async fn join(mut self) -> usize {
        let Some(handle) = self.handle.take() else {
            return 0;
        };
        match handle.await {
            Ok(forwarded) => forwarded,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(run_id = %self.run_id, error = %e, "forwarder task failed");
                }
                0
            }
        }
    }

    /// Stop forwarding now and wait for the task to unwind
    pub async fn cancel(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
        match handle.await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => debug!(run_id = %self.run_id, "forwarder cancelled"),
            Err(e) => warn!(run_id = %self.run_id, error = %e, "forwarder task failed"),
        }
    }
}

impl Drop for EventForwarder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
