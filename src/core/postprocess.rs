//! Artifact post-processing.
//!
//! After a run produces its final text, the post-processor pulls out the
//! embedded `Diagram JSON` section, asks the template generators for
//! deployable templates, and optionally re-derives the payload from the
//! generated template. Nothing here is run-fatal: every failure degrades to
//! an absent value and a warning.

use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::adapters::{Capability, GeneratorInput, StageInput, TemplateGenerator};
use crate::domain::{DiagramPayload, PipelineOutcome, RunId, TemplateBundle};

/// Title of the payload section inside an artifact
pub const PAYLOAD_HEADING: &str = "Diagram JSON";

/// A re-derived object must carry at least one of these to count as a payload
const PAYLOAD_KEYS: [&str; 3] = ["services", "groups", "connections"];

/// Schema instructions given to stages and to the cartographer
pub const SCHEMA_GUIDANCE: &str = r#"Always end with a section titled `Diagram JSON` followed by one fenced ```json block shaped like this:
{
  "services": [
    {
      "id": "<icon id, e.g. networking/10061-icon-service-Virtual-Networks>",
      "title": "<service title>",
      "category": "<catalogue category>",
      "description": "<one-sentence role of the service>",
      "groupIds": ["<ids of the groups containing this service>"]
    }
  ],
  "groups": [
    {
      "id": "<container id>",
      "label": "<display label>",
      "type": "<managementGroup|subscription|region|landingZone|resourceGroup|virtualNetwork|subnet|cluster|networkSecurityGroup|securityBoundary|policyAssignment|roleAssignment|default>",
      "parentId": "<optional parent group id>",
      "members": ["<ids of member services or nested groups>"]
    }
  ],
  "connections": [
    { "from": "<service id>", "to": "<service id>", "label": "<flow>" }
  ],
  "layout": "<optional layout hint>"
}
Nest groups through parentId and members, and keep every service inside its innermost group."#;

fn section_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)Diagram JSON\s*```json\s*(\{.*?\})\s*```").expect("valid section regex")
    })
}

/// Payload section found in an artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPayload {
    /// Exact JSON text between the fences
    pub raw: String,

    /// Parsed payload; `None` when the JSON is malformed
    pub parsed: Option<DiagramPayload>,
}

/// Locate and parse the payload section.
///
/// Returns `None` when there is no section. A malformed section still yields
/// its raw text with `parsed: None`.
pub fn extract_payload(text: &str) -> Option<ExtractedPayload> {
    let captures = section_regex().captures(text)?;
    let raw = captures.get(1)?.as_str().to_string();

    let parsed = match serde_json::from_str::<DiagramPayload>(&raw) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(error = %e, "failed to parse {} section", PAYLOAD_HEADING);
            None
        }
    };

    Some(ExtractedPayload { raw, parsed })
}

/// Render a complete payload section
pub fn render_section(raw: &str) -> String {
    format!("{}\n```json\n{}\n```", PAYLOAD_HEADING, raw)
}

/// Replace the payload section, or append one if the text has none.
///
/// Text outside the section is preserved byte for byte.
pub fn reinject(text: &str, raw: &str) -> String {
    let section = render_section(raw);

    if let Some(found) = section_regex().find(text) {
        let mut out = String::with_capacity(text.len() + section.len());
        out.push_str(&text[..found.start()]);
        out.push_str(&section);
        out.push_str(&text[found.end()..]);
        return out;
    }

    let separator = if text.is_empty() || text.ends_with("\n\n") {
        ""
    } else if text.ends_with('\n') {
        "\n"
    } else {
        "\n\n"
    };
    format!("{}{}{}", text, separator, section)
}

/// Slice of the first balanced `{...}` object in `text`, honoring JSON strings
pub fn find_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Prompt asking the cartographer to translate a template into the payload schema
pub fn cartographer_prompt(language: &str, source: &str) -> String {
    format!(
        "Translate the infrastructure template below into the structured diagram JSON. \
         Follow the schema and the nesting rules exactly.\n\n\
         {SCHEMA_GUIDANCE}\n\
         Template:\n```{language}\n{source}\n```\n\n\
         Reply with the JSON object only."
    )
}

/// Turns a run's final text into a [`PipelineOutcome`]
#[derive(Default)]
pub struct PostProcessor {
    generators: Vec<Arc<dyn TemplateGenerator>>,
    cartographer: Option<Arc<dyn Capability>>,
}

impl PostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template generator. Generators run concurrently.
    pub fn with_generator(mut self, generator: Arc<dyn TemplateGenerator>) -> Self {
        self.generators.push(generator);
        self
    }

    /// Capability used to re-derive the payload from a generated template
    pub fn with_cartographer(mut self, cartographer: Arc<dyn Capability>) -> Self {
        self.cartographer = Some(cartographer);
        self
    }

    pub fn generator_count(&self) -> usize {
        self.generators.len()
    }

    /// Run every generator concurrently; failures become absent entries
    pub async fn generate_templates(
        &self,
        payload: Option<&DiagramPayload>,
        narrative: &str,
    ) -> TemplateBundle {
        let jobs = self.generators.iter().map(|generator| async move {
            let kind = generator.kind();
            let input = match payload {
                Some(payload) => GeneratorInput::Payload(payload),
                None if kind.accepts_narrative() => GeneratorInput::Narrative(narrative),
                None => {
                    debug!(%kind, "no payload, skipping generator");
                    return (kind, None);
                }
            };
            match generator.generate(input).await {
                Ok(template) => (kind, Some(template)),
                Err(e) => {
                    warn!(%kind, error = %e, "template generation failed");
                    (kind, None)
                }
            }
        });

        let mut bundle = TemplateBundle::default();
        for (kind, template) in join_all(jobs).await {
            if template.is_some() || bundle.get(kind).is_none() {
                bundle.set(kind, template);
            }
        }

        debug!(
            bicep = bundle.bicep.is_some(),
            terraform = bundle.terraform.is_some(),
            "template bundle ready"
        );
        bundle
    }

    /// Ask the cartographer to rebuild the payload from the first available template.
    ///
    /// Returns the parsed payload and its pretty-printed JSON.
    pub async fn rederive_payload(
        &self,
        bundle: &TemplateBundle,
    ) -> Option<(DiagramPayload, String)> {
        let cartographer = self.cartographer.as_ref()?;
        let (kind, source) = bundle.source_template()?;

        let prompt = cartographer_prompt(kind.as_str(), source);
        let reply = match cartographer.invoke(&StageInput::Text(prompt)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "payload re-derivation failed");
                return None;
            }
        };

        let Some(blob) = find_first_json_object(&reply) else {
            warn!("cartographer reply contained no JSON object");
            return None;
        };

        let value: serde_json::Value = match serde_json::from_str(blob) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "cartographer reply is not valid JSON");
                return None;
            }
        };
        if !PAYLOAD_KEYS.iter().any(|key| value.get(key).is_some()) {
            warn!("cartographer reply has none of the payload keys");
            return None;
        }
        let raw = serde_json::to_string_pretty(&value).ok()?;
        match serde_json::from_value::<DiagramPayload>(value) {
            Ok(payload) => Some((payload, raw)),
            Err(e) => {
                warn!(error = %e, "cartographer reply does not match the payload schema");
                None
            }
        }
    }

    /// Extract, generate, re-derive, and reinject
    pub async fn finalize(&self, run_id: RunId, text: String) -> PipelineOutcome {
        let extracted = extract_payload(&text);
        let (mut payload, mut raw_payload) = match extracted {
            Some(found) => (found.parsed, Some(found.raw)),
            None => (None, None),
        };

        let templates = self.generate_templates(payload.as_ref(), &text).await;

        let mut final_text = text;
        let mut rederived = self.rederive_payload(&templates).await;
        let extracted_has_content = payload.as_ref().is_some_and(|p| !p.is_empty());
        if extracted_has_content && rederived.as_ref().is_some_and(|(derived, _)| derived.is_empty()) {
            warn!(%run_id, "re-derived payload is empty, keeping the extracted one");
            rederived = None;
        }
        if let Some((derived, raw)) = rederived {
            info!(%run_id, "payload re-derived from generated template");
            final_text = reinject(&final_text, &raw);
            payload = Some(derived);
            raw_payload = Some(raw);
        }

        PipelineOutcome {
            run_id,
            final_text,
            payload,
            raw_payload,
            templates,
        }
    }
}
