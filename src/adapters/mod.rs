//! Adapter interfaces for external collaborators.
//!
//! Every pipeline stage is a [`Capability`]; deployable templates come from a
//! [`TemplateGenerator`]. Concrete integrations adapt to these traits at the
//! boundary so the orchestrator never inspects their shape.

pub mod fabric;
pub mod http_generator;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DiagramPayload, GeneratedTemplate, TemplateKind};

pub use fabric::FabricCapability;
pub use http_generator::HttpTemplateGenerator;

/// Errors a capability can fail with
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{capability} failed: {message}")]
    Failed { capability: String, message: String },

    #[error("{capability} timed out after {seconds}s")]
    Timeout { capability: String, seconds: u64 },

    #[error("{capability} was cancelled")]
    Cancelled { capability: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CapabilityError {
    pub fn failed(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            capability: capability.into(),
            message: message.into(),
        }
    }
}

/// A chat-style message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub text: String,
}

impl Message {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// Input handed to a capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    Text(String),
    Messages(Vec<Message>),
}

impl StageInput {
    /// Flatten to plain text (messages rendered one per line as `role: text`)
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Messages(messages) => messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.text))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for StageInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StageInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One item of an incremental capability response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Incremental text
    Delta(String),

    /// A batch of messages, each carrying text
    Messages(Vec<Message>),

    /// The full response object, used only when no deltas arrive
    Response(String),
}

impl Fragment {
    /// Non-empty text pieces this fragment contributes to the output
    pub fn text_pieces(&self) -> Vec<&str> {
        match self {
            Self::Delta(text) if !text.is_empty() => vec![text.as_str()],
            Self::Messages(messages) => messages
                .iter()
                .map(|m| m.text.as_str())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Lazy sequence of response fragments
pub type FragmentStream = BoxStream<'static, Result<Fragment, CapabilityError>>;

/// A named unit that turns an input into output text
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stage name shown to observers
    fn name(&self) -> &str;

    /// Produce the whole output at once
    async fn invoke(&self, input: &StageInput) -> Result<String, CapabilityError>;

    /// Produce the output incrementally. `None` means streaming is unsupported.
    async fn invoke_streaming(
        &self,
        _input: &StageInput,
    ) -> Result<Option<FragmentStream>, CapabilityError> {
        Ok(None)
    }
}

/// Errors from template generators
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("{0} generator unavailable")]
    Unavailable(TemplateKind),

    #[error("{kind} generator failed: {message}")]
    Failed { kind: TemplateKind, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// What a generator is asked to work from
#[derive(Debug, Clone, Copy)]
pub enum GeneratorInput<'a> {
    Payload(&'a DiagramPayload),
    Narrative(&'a str),
}

/// Produces a deployable template of one kind
#[async_trait]
pub trait TemplateGenerator: Send + Sync {
    fn kind(&self) -> TemplateKind;

    async fn generate(
        &self,
        input: GeneratorInput<'_>,
    ) -> Result<GeneratedTemplate, GeneratorError>;
}
