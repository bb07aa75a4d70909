//! Post-Processing Integration Tests
//!
//! Payload extraction and reinjection, template generation, and
//! re-derivation from generated templates.

mod common;

use common::{stage, ScriptedGenerator, ScriptedStage};
use revue::core::{extract_payload, reinject, EventBus, Orchestrator, PostProcessor, SequentialRoster};
use revue::domain::{RunId, TemplateKind};

const GRID: &str = r#"{"services":[],"groups":[],"connections":[],"layout":"grid"}"#;

const RICH: &str = r#"{
  "services": [
    {
      "id": "networking/10061-icon-service-Virtual-Networks",
      "title": "Hub VNet",
      "category": "networking",
      "description": "Central hub network",
      "groupIds": ["rg-hub"]
    },
    {
      "id": "security/10245-icon-service-Key-Vaults",
      "title": "Key Vault",
      "category": "security",
      "description": "Secrets for $ENV workloads",
      "groupIds": ["rg-hub"]
    }
  ],
  "groups": [
    { "id": "sub-platform", "label": "Platform", "type": "subscription", "members": ["rg-hub"] },
    { "id": "rg-hub", "label": "Hub RG", "type": "resourceGroup", "parentId": "sub-platform",
      "members": ["networking/10061-icon-service-Virtual-Networks"] }
  ],
  "connections": [
    { "from": "networking/10061-icon-service-Virtual-Networks", "to": "security/10245-icon-service-Key-Vaults", "label": "private endpoint" }
  ],
  "layout": "hierarchical"
}"#;

#[test]
fn test_extract_exact_raw_substring() {
    let text = format!(
        "# Landing zone\n\nNarrative here.\n\nDiagram JSON\n```json\n{}\n```\n\n## Appendix\n",
        GRID
    );

    let found = extract_payload(&text).unwrap();
    assert_eq!(found.raw, GRID);
    assert!(text.contains(&found.raw));

    let payload = found.parsed.unwrap();
    assert!(payload.is_empty());
    assert_eq!(payload.layout, "grid");
}

#[test]
fn test_reinject_then_extract_round_trips() {
    let original = extract_payload(&format!("Diagram JSON\n```json\n{}\n```", RICH))
        .unwrap()
        .parsed
        .unwrap();
    assert_eq!(original.services.len(), 2);
    assert_eq!(original.groups[1].parent_id.as_deref(), Some("sub-platform"));

    for text in ["", "No section yet.", "Old\n\nDiagram JSON\n```json\n{\"layout\":\"x\"}\n```\ntail"] {
        let updated = reinject(text, RICH);
        let again = extract_payload(&updated).unwrap();
        assert_eq!(again.parsed.as_ref(), Some(&original));
        assert_eq!(again.raw, RICH);
    }
}

#[test]
fn test_append_keeps_prefix_byte_equal() {
    let text = "Intro paragraph.\n\nDecisions:\n- hub and spoke\n";
    let updated = reinject(text, GRID);

    assert!(updated.starts_with(text));
    assert_eq!(updated.matches("Diagram JSON").count(), 1);
    assert_eq!(extract_payload(&updated).unwrap().raw, GRID);
}

#[test]
fn test_replace_keeps_surroundings_byte_equal() {
    let head = "Intro\r\n\ttabs  and  spaces\n\n";
    let tail = "\n\n## After\nmore $1 text\n";
    let text = format!("{}Diagram JSON\n```json\n{}\n```{}", head, GRID, tail);

    let updated = reinject(&text, RICH);
    assert!(updated.starts_with(head));
    assert!(updated.ends_with(tail));
    assert_eq!(updated.matches("Diagram JSON").count(), 1);
}

#[tokio::test]
async fn test_generators_receive_payload() {
    let bicep = ScriptedGenerator::ok(TemplateKind::Bicep, "resource hub 'vnet' = {}");
    let terraform = ScriptedGenerator::ok(TemplateKind::Terraform, "resource \"azurerm_vnet\" \"hub\" {}");
    let post = PostProcessor::new()
        .with_generator(bicep.clone())
        .with_generator(terraform.clone());

    let payload = extract_payload(&format!("Diagram JSON\n```json\n{}\n```", GRID))
        .unwrap()
        .parsed
        .unwrap();
    let bundle = post.generate_templates(Some(&payload), "narrative").await;

    assert_eq!(bicep.calls(), vec!["payload"]);
    assert_eq!(terraform.calls(), vec!["payload"]);
    assert!(bundle.bicep.is_some());
    assert!(bundle.terraform.is_some());
}

#[tokio::test]
async fn test_without_payload_only_narrative_generator_runs() {
    let bicep = ScriptedGenerator::ok(TemplateKind::Bicep, "resource x 'y' = {}");
    let terraform = ScriptedGenerator::ok(TemplateKind::Terraform, "resource {}");
    let post = PostProcessor::new()
        .with_generator(bicep.clone())
        .with_generator(terraform.clone());

    let bundle = post.generate_templates(None, "a hub and spoke network").await;

    assert_eq!(bicep.calls(), vec!["narrative"]);
    assert!(terraform.calls().is_empty());
    assert!(bundle.bicep.is_some());
    assert!(bundle.terraform.is_none());
}

#[tokio::test]
async fn test_generator_failure_is_isolated() {
    let bicep = ScriptedGenerator::failing(TemplateKind::Bicep, "service unavailable");
    let terraform = ScriptedGenerator::ok(TemplateKind::Terraform, "resource {}");
    let post = PostProcessor::new()
        .with_generator(bicep)
        .with_generator(terraform);

    let text = format!("Report\n\nDiagram JSON\n```json\n{}\n```", GRID);
    let outcome = post.finalize(RunId::from("run-g"), text.clone()).await;

    assert_eq!(outcome.final_text, text);
    assert!(outcome.templates.bicep.is_none());
    assert_eq!(outcome.templates.terraform.unwrap().content, "resource {}");
    assert_eq!(outcome.raw_payload.as_deref(), Some(GRID));
}

#[tokio::test]
async fn test_rederived_payload_is_reinjected() {
    let bicep = ScriptedGenerator::ok(TemplateKind::Bicep, "resource hub 'Microsoft.Network/virtualNetworks' = {}");
    let cartographer = ScriptedStage::new("Cartographer", |prompt| {
        assert!(prompt.contains("```bicep\nresource hub"));
        Ok(format!("Here is the diagram:\n{}\nLet me know!", r#"{"services":[],"groups":[],"connections":[],"layout":"derived"}"#))
    })
    .arc();
    let post = PostProcessor::new()
        .with_generator(bicep)
        .with_cartographer(stage(&cartographer));

    let text = format!("Report body\n\nDiagram JSON\n```json\n{}\n```\n\nFooter", GRID);
    let outcome = post.finalize(RunId::from("run-d"), text).await;

    assert_eq!(outcome.payload.as_ref().unwrap().layout, "derived");
    assert!(outcome.final_text.starts_with("Report body\n\nDiagram JSON\n```json\n{\n"));
    assert!(outcome.final_text.ends_with("\n```\n\nFooter"));

    let reextracted = extract_payload(&outcome.final_text).unwrap();
    assert_eq!(Some(reextracted.raw), outcome.raw_payload);
    assert_eq!(reextracted.parsed, outcome.payload);
}

#[tokio::test]
async fn test_failed_rederivation_keeps_extracted_payload() {
    let bicep = ScriptedGenerator::ok(TemplateKind::Bicep, "resource x 'y' = {}");
    let cartographer = ScriptedStage::replying("Cartographer", "I cannot help with that.").arc();
    let post = PostProcessor::new()
        .with_generator(bicep)
        .with_cartographer(stage(&cartographer));

    let text = format!("Body\n\nDiagram JSON\n```json\n{}\n```", GRID);
    let outcome = post.finalize(RunId::from("run-f"), text.clone()).await;

    assert_eq!(outcome.final_text, text);
    assert_eq!(outcome.payload.unwrap().layout, "grid");
    assert_eq!(cartographer.seen_inputs().len(), 1);
}

#[tokio::test]
async fn test_non_payload_reply_keeps_extracted_payload() {
    let bicep = ScriptedGenerator::ok(TemplateKind::Bicep, "resource hub 'vnet' = {}");
    let cartographer = ScriptedStage::replying(
        "Cartographer",
        r#"I cannot do that: {"error": "unsupported template"}"#,
    )
    .arc();
    let post = PostProcessor::new()
        .with_generator(bicep)
        .with_cartographer(stage(&cartographer));

    let text = format!("Body\n\nDiagram JSON\n```json\n{}\n```", RICH);
    let outcome = post.finalize(RunId::from("run-e"), text.clone()).await;

    assert_eq!(outcome.final_text, text);
    assert_eq!(outcome.payload.unwrap().services.len(), 2);
    assert_eq!(outcome.raw_payload.as_deref(), Some(RICH));
    assert!(!outcome.final_text.contains("unsupported template"));
}

#[tokio::test]
async fn test_empty_rederivation_does_not_replace_content() {
    let bicep = ScriptedGenerator::ok(TemplateKind::Bicep, "resource hub 'vnet' = {}");
    let cartographer = ScriptedStage::replying(
        "Cartographer",
        r#"{"services":[],"groups":[],"connections":[],"layout":"grid"}"#,
    )
    .arc();
    let post = PostProcessor::new()
        .with_generator(bicep)
        .with_cartographer(stage(&cartographer));

    let text = format!("Body\n\nDiagram JSON\n```json\n{}\n```", RICH);
    let outcome = post.finalize(RunId::from("run-z"), text.clone()).await;

    assert_eq!(outcome.final_text, text);
    assert_eq!(outcome.payload.unwrap().connections.len(), 1);
}

#[tokio::test]
async fn test_malformed_section_degrades() {
    let text = "Body\n\nDiagram JSON\n```json\n{\"services\": oops}\n```";
    let outcome = PostProcessor::new().finalize(RunId::from("run-m"), text.to_string()).await;

    assert!(outcome.payload.is_none());
    assert_eq!(outcome.raw_payload.as_deref(), Some("{\"services\": oops}"));
    assert_eq!(outcome.final_text, text);
}

#[tokio::test]
async fn test_traced_run_post_processes_final_text() {
    let writer = ScriptedStage::replying(
        "Architect",
        &format!("Design\n\nDiagram JSON\n```json\n{}\n```", GRID),
    )
    .arc();
    let terraform = ScriptedGenerator::ok(TemplateKind::Terraform, "resource {}");
    let roster = SequentialRoster::new(vec![stage(&writer)]);

    let orchestrator = Orchestrator::new(EventBus::default())
        .with_post_processor(PostProcessor::new().with_generator(terraform.clone()));
    let outcome = orchestrator
        .run_sequential_traced(&roster, "design", None)
        .await
        .unwrap();

    assert_eq!(outcome.payload.unwrap().layout, "grid");
    assert_eq!(terraform.calls(), vec!["payload"]);
    assert!(outcome.templates.terraform.is_some());
}
