//! revue - Multi-stage review pipelines with live stage events
//!
//! Runs a roster of text-producing stages (sequentially, or as a draft
//! followed by a concurrent review group and a merge stage), publishes
//! per-stage lifecycle events to any number of observers, and
//! post-processes the final artifact into a structured diagram payload and
//! deployable templates.
//!
//! # Modules
//!
//! - `adapters`: Collaborator interfaces and integrations (Fabric, HTTP generators)
//! - `core`: Event bus, orchestrator, pipeline definitions, post-processing
//! - `domain`: Data structures (StageEvent, RunId, DiagramPayload, templates)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline, streaming stage events to stderr
//! echo "Design a landing zone for a fintech startup" | revue run landing_zone --trace
//!
//! # Pull the diagram payload out of a report
//! revue extract report.md
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{EventBus, Orchestrator, PipelineError, PostProcessor};
pub use domain::{DiagramPayload, PipelineOutcome, RunId, StageEvent};
