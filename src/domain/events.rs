//! Stage lifecycle events published while a pipeline runs.
//!
//! Events are immutable records. Each stage invocation produces exactly one
//! `start`, zero or more `delta`, and exactly one terminal `end` or `error`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::run::RunId;

/// Free-form display metadata attached to a stage (pillar, fan-out group, ...)
pub type StageMeta = BTreeMap<String, String>;

/// A single lifecycle event for one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// The run this event belongs to
    pub run_id: RunId,

    /// 1-based position of the stage in the pipeline, as a string
    pub step_id: String,

    /// Stage (agent) name
    pub agent: String,

    /// Lifecycle phase
    pub phase: Phase,

    /// When this event was produced
    pub ts: DateTime<Utc>,

    /// Display metadata for observers
    #[serde(default)]
    pub meta: StageMeta,

    /// Position within the run
    pub progress: Progress,

    /// Size and latency proxies
    pub telemetry: Telemetry,

    /// Text chunk (phase = delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_delta: Option<String>,

    /// Human summary (phase = end)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Failure message (phase = error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: RunId,
        step: usize,
        agent: impl Into<String>,
        phase: Phase,
        meta: StageMeta,
        progress: Progress,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            run_id,
            step_id: step.to_string(),
            agent: agent.into(),
            phase,
            ts: Utc::now(),
            meta,
            progress,
            telemetry,
            message_delta: None,
            summary: None,
            error: None,
        }
    }

    /// Attach a delta text chunk
    pub fn with_delta(mut self, chunk: impl Into<String>) -> Self {
        self.message_delta = Some(chunk.into());
        self
    }

    /// Attach a completion summary
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Attach an error message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Whether this event closes its stage invocation
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Lifecycle phase of a stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    Delta,
    End,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Delta => "delta",
            Self::End => "end",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current step out of the known total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl Progress {
    pub fn new(current: usize, total: usize) -> Self {
        Self { current, total }
    }

    /// Completed fraction in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current.min(self.total) as f64) / (self.total as f64)
    }
}

/// Token-count proxies and elapsed time for a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
}

/// Whitespace-token count, used as a latency-free size proxy
pub fn token_proxy(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}
