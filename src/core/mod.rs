//! Core orchestration logic.
//!
//! This module contains:
//! - EventBus: Run-scoped pub/sub of stage events
//! - Pipeline: Rosters and YAML pipeline definitions
//! - Orchestrator: Sequential and fan-out execution engine
//! - PostProcessor: Payload extraction, template generation, reinjection
//! - EventForwarder: Bus-to-transport bridge

pub mod event_bus;
pub mod forwarder;
pub mod orchestrator;
pub mod pipeline;
pub mod postprocess;

// Re-export commonly used types
pub use event_bus::{EventBus, Subscription};
pub use forwarder::{ChannelSink, EventForwarder, EventSink, Framing, TraceMessage, WriterSink};
pub use orchestrator::{Orchestrator, PipelineError, MERGE_DELIMITER};
pub use pipeline::{ExecutionMode, FanOutRoster, PipelineDef, Roster, SequentialRoster, StageDef};
pub use postprocess::{extract_payload, reinject, ExtractedPayload, PostProcessor};
