//! HTTP template generator.
//!
//! Endpoint contract: `POST <url>` with `{"diagram": {...}}` or
//! `{"narrative": "..."}`, answering `{"content": "...", "metadata": {...}}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GeneratorError, GeneratorInput, TemplateGenerator};
use crate::domain::{DiagramPayload, GeneratedTemplate, TemplateKind};

/// Request body sent to a generator endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum GenerateRequest<'a> {
    Diagram(&'a DiagramPayload),
    Narrative(&'a str),
}

/// Response body expected from a generator endpoint
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Template generator reached over HTTP
pub struct HttpTemplateGenerator {
    kind: TemplateKind,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTemplateGenerator {
    pub fn new(kind: TemplateKind, endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            kind,
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TemplateGenerator for HttpTemplateGenerator {
    fn kind(&self) -> TemplateKind {
        self.kind
    }

    async fn generate(
        &self,
        input: GeneratorInput<'_>,
    ) -> Result<GeneratedTemplate, GeneratorError> {
        let body = match input {
            GeneratorInput::Payload(payload) => GenerateRequest::Diagram(payload),
            GeneratorInput::Narrative(text) => GenerateRequest::Narrative(text),
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Failed {
                kind: self.kind,
                message: format!("HTTP {}: {}", status, text.trim()),
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        debug!(kind = %self.kind, endpoint = %self.endpoint, "template generated");

        match parsed.content {
            Some(content) if !content.trim().is_empty() => Ok(GeneratedTemplate {
                content,
                metadata: parsed.metadata,
            }),
            _ => Err(GeneratorError::Unavailable(self.kind)),
        }
    }
}
