use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use etl_engine::config::{
    ConfigurationProvider, ConnectorRegistry, EngineSettings, FileConfigurationProvider, PipelineConfiguration,
    ProcessorConfiguration,
};
use etl_engine::etl_core::connector::{MemorySink, MemorySource};
use etl_engine::observability::init_logging;
use etl_engine::pipeline::processing::rules::RuleEngine;
use etl_engine::pipeline::{OrchestratorSettings, PipelineOrchestrator};
use etl_engine::{ExecutionContext, Record};

#[derive(Parser)]
#[command(name = "etl-engine")]
#[command(about = "Run and inspect declarative ETL pipelines")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a pipeline configuration and report validation issues
    Validate {
        /// Pipeline configuration file (json, yaml or toml)
        config: PathBuf,
    },
    /// Print stage order and rule/mapping statistics
    Inspect {
        config: PathBuf,
    },
    /// Execute a pipeline against records read from a JSON file
    Run {
        config: PathBuf,
        /// JSON array of records, exposed to the pipeline as source `input`
        #[arg(long)]
        input: PathBuf,
        /// Where to write the records collected by destination `output` (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load environment variables
    dotenv::dotenv().ok();

    let settings = EngineSettings::load().context("Failed to load engine settings")?;
    let _log_guard = init_logging(&settings).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Validate { config } => validate(&config).await,
        Commands::Inspect { config } => inspect(&config).await,
        Commands::Run { config, input, output } => run(&settings, &config, &input, output.as_deref()).await,
    }
}

async fn load_configuration(path: &Path) -> anyhow::Result<PipelineConfiguration> {
    let path = path.to_str().context("Configuration path is not valid UTF-8")?;
    let config = FileConfigurationProvider::new()
        .load_pipeline_configuration(path, None)
        .await?;
    Ok(config)
}

/// In-memory stand-ins for every connector the configuration names.
fn placeholder_connectors(config: &PipelineConfiguration) -> ConnectorRegistry {
    let mut connectors = ConnectorRegistry::new();
    for stage in &config.stages {
        if let Some(name) = &stage.source {
            connectors.register_source(name.clone(), Arc::new(MemorySource::new(name.clone(), Vec::new())));
        }
        if let Some(name) = &stage.destination {
            connectors.register_destination(name.clone(), Arc::new(MemorySink::new(name.clone())));
        }
    }
    connectors
}

async fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load_configuration(path).await?;
    let pipeline = config.build(&placeholder_connectors(&config))?;
    let result = pipeline.validate(&ExecutionContext::new());

    for warning in result.warnings() {
        println!("⚠️  {}", warning);
    }
    for issue in result.errors() {
        println!("❌ {}", issue);
    }
    if !result.is_valid() {
        bail!("Pipeline '{}' has {} validation errors", config.id, result.errors().len());
    }
    println!("✅ Pipeline '{}' is valid ({} stages)", config.id, pipeline.stage_count());
    Ok(())
}

async fn inspect(path: &Path) -> anyhow::Result<()> {
    let config = load_configuration(path).await?;
    let pipeline = config.build(&placeholder_connectors(&config))?;
    let registry = config.transformation_registry();

    println!("📋 Pipeline '{}' ({})", config.name, config.id);
    if !config.description.is_empty() {
        println!("   {}", config.description);
    }
    println!("   Transformations: {:?}", registry.names());

    for (position, stage) in pipeline.stages().iter().enumerate() {
        let enabled = if stage.enabled { "" } else { " [disabled]" };
        println!(
            "\n{}. {} ({:?}, order {}){}",
            position + 1,
            stage.id(),
            stage.stage_type(),
            stage.order,
            enabled
        );
        let Some(stage_config) = config.stages.iter().find(|s| s.id == stage.id()) else {
            continue;
        };
        for processor in &stage_config.processors {
            match processor {
                ProcessorConfiguration::Rules { rules } => {
                    let stats = RuleEngine::with_rules(registry.clone(), rules.clone()).get_statistics();
                    println!(
                        "   rules: {} total, {} enabled, by priority {:?}",
                        stats.total_rules, stats.enabled_rules, stats.priority_histogram
                    );
                }
                ProcessorConfiguration::Mapping(mapper) => {
                    let stats = mapper.build().get_statistics();
                    println!(
                        "   mapping '{}': {} mappings ({} direct, {} transformed, {} constant, {} conditional, {} required)",
                        mapper.name,
                        stats.total,
                        stats.direct,
                        stats.transformed,
                        stats.constant,
                        stats.conditional,
                        stats.required
                    );
                }
                ProcessorConfiguration::Transformation { name } => println!("   transformation: {}", name),
            }
        }
    }
    Ok(())
}

async fn run(settings: &EngineSettings, path: &Path, input: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let config = load_configuration(path).await?;
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read input file '{}'", input.display()))?;
    let records: Vec<Record> = serde_json::from_str(&raw).context("Input must be a JSON array of records")?;
    info!("📥 Loaded {} input records from {}", records.len(), input.display());

    let sink = MemorySink::new("output");
    let mut connectors = ConnectorRegistry::new();
    connectors.register_source("input", Arc::new(MemorySource::new("input", records)));
    connectors.register_destination("output", Arc::new(sink.clone()));

    let config = config.with_default_parallelism(settings.max_degree_of_parallelism);
    let pipeline = Arc::new(config.build(&connectors)?);
    let orchestrator = PipelineOrchestrator::new(OrchestratorSettings {
        history_retention: settings.history_retention,
    });
    let result = orchestrator.execute(pipeline, ExecutionContext::new()).await?;

    let rendered = serde_json::to_string_pretty(&sink.records())?;
    match output {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("Failed to write output file '{}'", path.display()))?;
            info!("💾 Wrote {} records to {}", sink.records().len(), path.display());
        }
        None => println!("{}", rendered),
    }

    eprintln!("\n📊 Pipeline Results for {}:", result.pipeline_name);
    eprintln!("   Status: {}", result.status);
    eprintln!("   Records processed: {}", result.records_processed);
    eprintln!("   Records failed: {}", result.statistics.records_failed);
    eprintln!("   Errors: {}", result.errors.len());
    eprintln!("   Duration: {:.2}s", result.duration.as_secs_f64());
    for issue in &result.errors {
        error!("{}", issue);
    }

    if !result.is_success {
        bail!("Pipeline '{}' finished with status {}", result.pipeline_id, result.status);
    }
    Ok(())
}
