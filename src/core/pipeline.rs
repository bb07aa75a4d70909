//! Pipeline definitions and stage rosters.
//!
//! Pipelines are defined in YAML as an ordered list of stages plus an
//! execution mode. A definition is turned into a roster of live
//! capabilities before it runs.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::Capability;
use crate::domain::StageMeta;

/// Placeholder tag for stages that govern no particular pillar
pub const NO_PILLAR: &str = "-";

/// Positional pillar tags for the sequential review roster
pub const SEQUENTIAL_PILLARS: [&str; 8] = [
    NO_PILLAR,
    "Security",
    "Identity & Governance",
    "Operational Excellence",
    "Reliability",
    "Cost Optimization",
    "Compliance",
    NO_PILLAR,
];

/// Positional pillar tags for the fan-out group
pub const FAN_OUT_PILLARS: [&str; 5] = [
    "Reliability",
    "Cost Optimization",
    "Networking",
    "Observability",
    "Data & Storage",
];

/// Default tag shared by every member of the fan-out group
pub const DEFAULT_FAN_OUT_GROUP: &str = "fanout-1";

/// Metadata keys
pub const META_PILLAR: &str = "waf_pillar";
pub const META_PARALLEL_GROUP: &str = "parallel_group";
pub const META_AGGREGATOR: &str = "aggregator";

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// How stages are executed
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Stages in roster order. For fan-out: writer, merge, then the parallel group.
    pub stages: Vec<StageDef>,

    /// Positional pillar tags; defaults depend on the mode
    #[serde(default)]
    pub pillars: Option<Vec<String>>,

    /// Group tag for fan-out members
    #[serde(default)]
    pub fan_out_group: Option<String>,
}

impl PipelineDef {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }

        if self.mode == ExecutionMode::FanOut && self.stages.len() < 2 {
            anyhow::bail!("Fan-out pipeline needs at least a writer and a merge stage");
        }

        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                anyhow::bail!("Stage {} has an empty name", i);
            }
            if stage.action.is_empty() {
                anyhow::bail!("Stage '{}' has an empty action", stage.name);
            }
            if self.stages[..i].iter().any(|s| s.name == stage.name) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name);
            }
        }

        Ok(())
    }

    /// Positional tags in effect for this definition
    pub fn effective_pillars(&self) -> Vec<String> {
        if let Some(pillars) = &self.pillars {
            return pillars.clone();
        }
        let defaults: &[&str] = match self.mode {
            ExecutionMode::Sequential => &SEQUENTIAL_PILLARS,
            ExecutionMode::FanOut => &FAN_OUT_PILLARS,
        };
        defaults.iter().map(|p| p.to_string()).collect()
    }

    /// Build a live roster, creating one capability per stage
    pub fn build_roster<F>(&self, mut make: F) -> Result<Roster>
    where
        F: FnMut(&StageDef) -> Arc<dyn Capability>,
    {
        self.validate()?;
        let capabilities: Vec<Arc<dyn Capability>> = self.stages.iter().map(&mut make).collect();
        let pillars = self.effective_pillars();

        match self.mode {
            ExecutionMode::Sequential => Ok(Roster::Sequential(
                SequentialRoster::new(capabilities).with_pillars(pillars),
            )),
            ExecutionMode::FanOut => {
                let mut roster = FanOutRoster::from_stages(capabilities)?.with_pillars(pillars);
                if let Some(group) = &self.fan_out_group {
                    roster = roster.with_group(group.clone());
                }
                Ok(Roster::FanOut(roster))
            }
        }
    }
}

/// A single stage in a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Action/pattern the capability executes
    pub action: String,
}

/// Supported execution modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Each stage consumes the previous stage's output
    #[default]
    Sequential,

    /// Writer, concurrent reviewers over the draft, then a merge stage
    FanOut,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::FanOut => "fan_out",
        }
    }
}

/// A roster ready to run
pub enum Roster {
    Sequential(SequentialRoster),
    FanOut(FanOutRoster),
}

impl Roster {
    /// Total number of stage invocations in a full run
    pub fn total_steps(&self) -> usize {
        match self {
            Self::Sequential(roster) => roster.len(),
            Self::FanOut(roster) => roster.total_steps(),
        }
    }
}

/// Stages executed strictly in order
#[derive(Clone)]
pub struct SequentialRoster {
    pub stages: Vec<Arc<dyn Capability>>,
    pub pillars: Vec<String>,
}

impl SequentialRoster {
    pub fn new(stages: Vec<Arc<dyn Capability>>) -> Self {
        Self {
            stages,
            pillars: SEQUENTIAL_PILLARS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_pillars(mut self, pillars: Vec<String>) -> Self {
        self.pillars = pillars;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Display metadata for the stage at 0-based `index`
    pub fn meta_for(&self, index: usize) -> StageMeta {
        let pillar = self
            .pillars
            .get(index)
            .map(String::as_str)
            .unwrap_or(NO_PILLAR);
        StageMeta::from([(META_PILLAR.to_string(), pillar.to_string())])
    }
}

/// Writer, a concurrent review group, and a merge stage
#[derive(Clone)]
pub struct FanOutRoster {
    pub writer: Arc<dyn Capability>,
    pub merge: Arc<dyn Capability>,
    pub parallel: Vec<Arc<dyn Capability>>,
    pub pillars: Vec<String>,
    pub group: String,
}

impl FanOutRoster {
    pub fn new(
        writer: Arc<dyn Capability>,
        merge: Arc<dyn Capability>,
        parallel: Vec<Arc<dyn Capability>>,
    ) -> Self {
        Self {
            writer,
            merge,
            parallel,
            pillars: FAN_OUT_PILLARS.iter().map(|p| p.to_string()).collect(),
            group: DEFAULT_FAN_OUT_GROUP.to_string(),
        }
    }

    /// Split a flat roster `[writer, merge, ...parallel]`
    pub fn from_stages(stages: Vec<Arc<dyn Capability>>) -> Result<Self> {
        let mut iter = stages.into_iter();
        match (iter.next(), iter.next()) {
            (Some(writer), Some(merge)) => Ok(Self::new(writer, merge, iter.collect())),
            _ => anyhow::bail!("Fan-out roster needs at least a writer and a merge stage"),
        }
    }

    pub fn with_pillars(mut self, pillars: Vec<String>) -> Self {
        self.pillars = pillars;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Draft + parallel group + merge
    pub fn total_steps(&self) -> usize {
        self.parallel.len() + 2
    }

    pub fn writer_meta(&self) -> StageMeta {
        StageMeta::from([(META_PILLAR.to_string(), NO_PILLAR.to_string())])
    }

    /// Display metadata for the parallel member at 0-based `index`
    pub fn member_meta(&self, index: usize) -> StageMeta {
        let pillar = self
            .pillars
            .get(index)
            .map(String::as_str)
            .unwrap_or(NO_PILLAR);
        StageMeta::from([
            (META_PARALLEL_GROUP.to_string(), self.group.clone()),
            (META_PILLAR.to_string(), pillar.to_string()),
        ])
    }

    pub fn merge_meta(&self) -> StageMeta {
        StageMeta::from([(META_AGGREGATOR.to_string(), self.merge.name().to_string())])
    }
}
