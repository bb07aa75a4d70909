//! Run identifiers and the result of a traced pipeline run.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{DiagramPayload, TemplateBundle};

/// Opaque, caller-visible run identifier.
///
/// Freshly generated ids sort lexically by creation time:
/// `run-YYYY-MM-DD-HHMMSSZ-xxxx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a new time-sortable id with a short random disambiguator
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y-%m-%d-%H%M%SZ");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("run-{}-{}", stamp, &suffix[..4]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Everything a traced run hands back to its caller.
///
/// The text is always present; the payload and templates are best-effort extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub run_id: RunId,

    /// Final artifact text (with the payload section reinjected if re-derived)
    pub final_text: String,

    /// Parsed structured payload, if one was extracted or re-derived
    pub payload: Option<DiagramPayload>,

    /// Raw JSON text of the payload section
    pub raw_payload: Option<String>,

    /// Generated deployable templates
    pub templates: TemplateBundle,
}
