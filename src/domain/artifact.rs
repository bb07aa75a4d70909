//! Structured payload embedded in artifact text, and generated templates.
//!
//! The payload is a small architecture graph: typed services, nested group
//! containers, and labeled connections between services.

use serde::{Deserialize, Serialize};

/// Graph payload carried inside the final artifact text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagramPayload {
    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(default)]
    pub groups: Vec<Group>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Layout hint (horizontal, vertical, grid)
    #[serde(default)]
    pub layout: String,
}

impl DiagramPayload {
    /// Whether the payload describes nothing at all
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.groups.is_empty() && self.connections.is_empty()
    }

    /// Look up a group by id
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Groups with no parent
    pub fn root_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.parent_id.is_none())
    }
}

/// A typed service node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
}

/// A container that nests services and other groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub group_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

/// A labeled edge between two services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: String,
}

/// Kinds of deployable template the post-processor can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Bicep,
    Terraform,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 2] = [TemplateKind::Bicep, TemplateKind::Terraform];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bicep => "bicep",
            Self::Terraform => "terraform",
        }
    }

    /// Whether the generator for this kind can work from narrative text alone
    pub fn accepts_narrative(self) -> bool {
        matches!(self, Self::Bicep)
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one template generator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTemplate {
    /// Template source text
    pub content: String,

    /// Generator-specific metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl GeneratedTemplate {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Per-kind generation results. `None` means unavailable or failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateBundle {
    pub bicep: Option<GeneratedTemplate>,
    pub terraform: Option<GeneratedTemplate>,
}

impl TemplateBundle {
    pub fn get(&self, kind: TemplateKind) -> Option<&GeneratedTemplate> {
        match kind {
            TemplateKind::Bicep => self.bicep.as_ref(),
            TemplateKind::Terraform => self.terraform.as_ref(),
        }
    }

    pub fn set(&mut self, kind: TemplateKind, template: Option<GeneratedTemplate>) {
        match kind {
            TemplateKind::Bicep => self.bicep = template,
            TemplateKind::Terraform => self.terraform = template,
        }
    }

    /// First template with non-blank source, in kind order
    pub fn source_template(&self) -> Option<(TemplateKind, &str)> {
        TemplateKind::ALL.into_iter().find_map(|kind| {
            self.get(kind)
                .map(|t| t.content.trim())
                .filter(|content| !content.is_empty())
                .map(|content| (kind, content))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bicep.is_none() && self.terraform.is_none()
    }
}
