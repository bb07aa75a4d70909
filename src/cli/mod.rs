//! Command-line interface for revue.
//!
//! Provides commands for running review pipelines, working with the
//! embedded diagram payload of an artifact, listing pipeline definitions,
//! and showing the resolved configuration.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::adapters::{Capability, FabricCapability, HttpTemplateGenerator};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    extract_payload, reinject, EventBus, EventForwarder, Framing, Orchestrator, PipelineDef,
    PostProcessor, WriterSink,
};
use crate::domain::{PipelineOutcome, TemplateKind};

/// revue - Multi-stage review pipelines with live stage events
#[derive(Parser, Debug)]
#[command(name = "revue")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline name (will look for <pipelines dir>/<name>.yaml)
        pipeline_name: String,

        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Read input from stdin
        #[arg(long)]
        stdin: bool,

        /// Forward stage events to stderr while running
        #[arg(long)]
        trace: bool,

        /// Framing used for forwarded events
        #[arg(long, value_enum, default_value = "json")]
        format: TraceFormat,

        /// Conversation id attached to forwarded events
        #[arg(long)]
        conversation: Option<String>,

        /// Write the diagram payload JSON to this file
        #[arg(long)]
        payload_out: Option<PathBuf>,

        /// Write generated templates into this directory
        #[arg(long)]
        templates_out: Option<PathBuf>,
    },

    /// Print the Diagram JSON section of an artifact
    Extract {
        /// Artifact file
        file: PathBuf,
    },

    /// Replace or append the Diagram JSON section of an artifact
    Inject {
        /// Artifact file
        file: PathBuf,

        /// JSON file holding the new payload
        #[arg(short, long)]
        payload: PathBuf,
    },

    /// List available pipeline definitions
    Pipelines,

    /// Show resolved configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum TraceFormat {
    /// One JSON document per line
    Json,
    /// Server-sent events frames
    Sse,
}

impl From<TraceFormat> for Framing {
    fn from(format: TraceFormat) -> Self {
        match format {
            TraceFormat::Json => Framing::JsonLines,
            TraceFormat::Sse => Framing::Sse,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline_name,
                input,
                stdin,
                trace,
                format,
                conversation,
                payload_out,
                templates_out,
            } => {
                let options = RunOptions {
                    trace,
                    framing: format.into(),
                    conversation,
                    payload_out,
                    templates_out,
                };
                run_pipeline(&pipeline_name, input, stdin, options).await
            }
            Commands::Extract { file } => extract(&file),
            Commands::Inject { file, payload } => inject(&file, &payload),
            Commands::Pipelines => list_pipelines(),
            Commands::Config => show_config(),
        }
    }
}

struct RunOptions {
    trace: bool,
    framing: Framing,
    conversation: Option<String>,
    payload_out: Option<PathBuf>,
    templates_out: Option<PathBuf>,
}

/// Run a pipeline with the given input
async fn run_pipeline(
    pipeline_name: &str,
    input_file: Option<PathBuf>,
    use_stdin: bool,
    options: RunOptions,
) -> Result<()> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(cfg, pipeline_name)?;

    let input = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if use_stdin || !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    };

    if input.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    let roster = pipeline.build_roster(|stage| {
        Arc::new(
            FabricCapability::new(&stage.name, &stage.action)
                .with_binary_path(&cfg.fabric.binary)
                .with_timeout(cfg.stages.step_timeout())
                .with_streaming(cfg.fabric.stream),
        ) as Arc<dyn Capability>
    })?;

    let bus = EventBus::new(cfg.bus.finished_retention);
    let run_id = bus.new_run_id();
    bus.ensure_run(&run_id);

    let forwarder = options.trace.then(|| {
        EventForwarder::spawn(
            &bus,
            &run_id,
            WriterSink::new(tokio::io::stderr(), options.framing),
            options.conversation.clone(),
        )
    });

    let orchestrator = Orchestrator::new(bus.clone()).with_post_processor(build_post_processor(cfg)?);
    eprintln!("[Run {} started: {}]", run_id, pipeline.name);

    let result = orchestrator
        .run_traced(&roster, &input, Some(run_id.clone()))
        .await;
    bus.finish(&run_id);
    if let Some(forwarder) = forwarder {
        forwarder.join().await;
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("\n[Run {} failed: {}]", run_id, e);
            std::process::exit(1);
        }
    };

    println!("{}", outcome.final_text);
    write_outputs(&outcome, &options)?;
    eprintln!("\n[Run {} completed successfully]", outcome.run_id);

    Ok(())
}

/// Template generators and cartographer from configuration
fn build_post_processor(cfg: &ResolvedConfig) -> Result<PostProcessor> {
    let mut post = PostProcessor::new();

    let endpoints = [
        (TemplateKind::Bicep, cfg.generators.bicep_url.as_ref()),
        (TemplateKind::Terraform, cfg.generators.terraform_url.as_ref()),
    ];
    for (kind, url) in endpoints {
        if let Some(url) = url {
            let generator = HttpTemplateGenerator::new(kind, url, cfg.generators.timeout())
                .with_context(|| format!("Failed to build {} generator", kind))?;
            post = post.with_generator(Arc::new(generator));
        }
    }

    if let Some(pattern) = &cfg.cartographer_pattern {
        let cartographer = FabricCapability::new("Cartographer", pattern)
            .with_binary_path(&cfg.fabric.binary)
            .with_timeout(cfg.stages.step_timeout())
            .with_streaming(false);
        post = post.with_cartographer(Arc::new(cartographer));
    }

    Ok(post)
}

fn write_outputs(outcome: &PipelineOutcome, options: &RunOptions) -> Result<()> {
    if let Some(path) = &options.payload_out {
        match &outcome.raw_payload {
            Some(raw) => std::fs::write(path, raw)
                .with_context(|| format!("Failed to write payload: {}", path.display()))?,
            None => eprintln!("[No Diagram JSON section in final text]"),
        }
    }

    if let Some(dir) = &options.templates_out {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        for kind in TemplateKind::ALL {
            let Some(template) = outcome.templates.get(kind) else {
                continue;
            };
            let file_name = match kind {
                TemplateKind::Bicep => "main.bicep",
                TemplateKind::Terraform => "main.tf",
            };
            let path = dir.join(file_name);
            std::fs::write(&path, &template.content)
                .with_context(|| format!("Failed to write template: {}", path.display()))?;
            eprintln!("[Wrote {}]", path.display());
        }
    }

    Ok(())
}

/// Load a pipeline by name
fn load_pipeline(cfg: &ResolvedConfig, name: &str) -> Result<PipelineDef> {
    let candidates = [
        cfg.pipeline_path(name),
        PathBuf::from("pipelines").join(format!("{}.yaml", name)),
        PathBuf::from(format!("{}.yaml", name)),
    ];

    for path in &candidates {
        if path.exists() {
            let pipeline = PipelineDef::from_file(path)?;
            pipeline.validate()?;
            return Ok(pipeline);
        }
    }

    let looked: Vec<String> = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect();
    anyhow::bail!("Pipeline '{}' not found. Looked for:\n{}", name, looked.join("\n"));
}

fn read_artifact(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact: {}", path.display()))
}

/// Print the raw payload of an artifact
fn extract(file: &Path) -> Result<()> {
    let text = read_artifact(file)?;
    let found = extract_payload(&text)
        .with_context(|| format!("No Diagram JSON section in {}", file.display()))?;

    if found.parsed.is_none() {
        eprintln!("[Diagram JSON section is not valid payload JSON]");
    }
    println!("{}", found.raw);
    Ok(())
}

/// Print the artifact with its payload section replaced or appended
fn inject(file: &Path, payload: &Path) -> Result<()> {
    let text = read_artifact(file)?;
    let raw = std::fs::read_to_string(payload)
        .with_context(|| format!("Failed to read payload: {}", payload.display()))?;

    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Payload is not valid JSON: {}", payload.display()))?;
    if !value.is_object() {
        anyhow::bail!("Payload must be a JSON object");
    }

    print!("{}", reinject(&text, raw.trim()));
    Ok(())
}

/// List pipeline definitions in the configured directory
fn list_pipelines() -> Result<()> {
    let dir = config::pipelines_dir()?;
    if !dir.exists() {
        println!("No pipelines directory at {}", dir.display());
        return Ok(());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        println!("No pipelines found in {}", dir.display());
        return Ok(());
    }

    println!("{:<28} {:<11} {:>6}  DESCRIPTION", "NAME", "MODE", "STAGES");
    for path in paths {
        match PipelineDef::from_file(&path) {
            Ok(pipeline) => println!(
                "{:<28} {:<11} {:>6}  {}",
                pipeline.name,
                pipeline.mode.as_str(),
                pipeline.stages.len(),
                pipeline.description
            ),
            Err(e) => eprintln!("{}: {:#}", path.display(), e),
        }
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("revue configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Pipelines: {}", cfg.pipelines.display());
    println!();
    println!("Fabric:");
    println!("  Binary:    {}", cfg.fabric.binary);
    println!("  Streaming: {}", cfg.fabric.stream);
    println!("  Timeout:   {}s per stage", cfg.stages.step_timeout_seconds);
    println!();
    println!("Event bus:");
    println!("  Finished run retention: {}", cfg.bus.finished_retention);
    println!();
    println!("Template generators:");
    println!("  Bicep:     {}", cfg.generators.bicep_url.as_deref().unwrap_or("(disabled)"));
    println!("  Terraform: {}", cfg.generators.terraform_url.as_deref().unwrap_or("(disabled)"));
    println!("  Timeout:   {}s", cfg.generators.timeout_seconds);
    println!(
        "  Cartographer pattern: {}",
        cfg.cartographer_pattern.as_deref().unwrap_or("(disabled)")
    );

    Ok(())
}
