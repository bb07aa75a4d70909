//! Domain types for pipeline runs.
//!
//! This module contains:
//! - StageEvent: lifecycle records streamed to observers
//! - RunId / PipelineOutcome: run identity and results
//! - DiagramPayload / TemplateBundle: artifact side-payloads

pub mod artifact;
pub mod events;
pub mod run;

pub use artifact::{
    Connection, DiagramPayload, GeneratedTemplate, Group, Service, TemplateBundle, TemplateKind,
};
pub use events::{token_proxy, Phase, Progress, StageEvent, StageMeta, Telemetry};
pub use run::{PipelineOutcome, RunId};
