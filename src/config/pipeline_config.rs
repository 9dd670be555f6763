use etl_core::connector::{DestinationConnector, SourceConnector};
use etl_core::{EtlError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::pipeline::processing::mapping::{DataMapper, Mapping};
use crate::pipeline::processing::rules::{Condition, RuleEngine, TransformationRule};
use crate::pipeline::processing::transform::{TransformationRegistry, TransformationSpec};
use crate::pipeline::steps::{Processor, RecordStage};
use crate::pipeline::{ErrorHandling, Pipeline, PipelineSettings, PipelineStage, RetryPolicy, StageType};

fn default_enabled() -> bool {
    true
}

/// Serialized form of a complete pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Record concurrency for stages without their own; unset means the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_degree_of_parallelism: Option<usize>,
    /// Named transformations available to rules and stages.
    #[serde(default)]
    pub transformations: BTreeMap<String, TransformationSpec>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub stages: Vec<StageConfiguration>,
}

/// Serialized form of one record-processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfiguration {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stage_type: StageType,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Name of a registered source connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Name of a registered destination connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default)]
    pub processors: Vec<ProcessorConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Falls back to the pipeline's `max_degree_of_parallelism`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorConfiguration {
    Rules { rules: Vec<TransformationRule> },
    Mapping(MapperConfiguration),
    Transformation { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfiguration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fields the source is known to supply; enables required-field validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fields: Option<Vec<String>>,
    pub mappings: Vec<Mapping>,
}

impl MapperConfiguration {
    pub fn build(&self) -> DataMapper {
        let mut mapper = DataMapper::new(self.name.clone(), self.mappings.clone());
        if let Some(description) = &self.description {
            mapper = mapper.with_description(description.clone());
        }
        if let Some(fields) = &self.source_fields {
            mapper = mapper.with_source_fields(fields.iter().cloned());
        }
        mapper
    }
}

/// Connectors that stage configurations refer to by name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceConnector>>,
    destinations: HashMap<String, Arc<dyn DestinationConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, name: impl Into<String>, source: Arc<dyn SourceConnector>) {
        self.sources.insert(name.into(), source);
    }

    pub fn register_destination(&mut self, name: impl Into<String>, destination: Arc<dyn DestinationConnector>) {
        self.destinations.insert(name.into(), destination);
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn SourceConnector>> {
        self.sources.get(name).cloned()
    }

    pub fn destination(&self, name: &str) -> Option<Arc<dyn DestinationConnector>> {
        self.destinations.get(name).cloned()
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<&String> = self.sources.keys().collect();
        let mut destinations: Vec<&String> = self.destinations.keys().collect();
        sources.sort();
        destinations.sort();
        f.debug_struct("ConnectorRegistry")
            .field("sources", &sources)
            .field("destinations", &destinations)
            .finish()
    }
}

impl PipelineConfiguration {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            error_handling: self.error_handling,
            retry: self.retry,
            max_degree_of_parallelism: self.max_degree_of_parallelism.unwrap_or(1),
        }
    }

    /// Fill in the pipeline parallelism when the configuration leaves it unset.
    pub fn with_default_parallelism(mut self, parallelism: usize) -> Self {
        self.max_degree_of_parallelism.get_or_insert(parallelism);
        self
    }

    pub fn transformation_registry(&self) -> TransformationRegistry {
        TransformationRegistry::from_specs(&self.transformations)
    }

    /// Resolve connector and transformation names and assemble the pipeline.
    pub fn build(&self, connectors: &ConnectorRegistry) -> Result<Pipeline> {
        let registry = self.transformation_registry();
        let mut pipeline = Pipeline::new(self.id.clone(), self.name.clone())
            .with_description(self.description.clone())
            .with_settings(self.settings());
        for (key, value) in &self.metadata {
            pipeline = pipeline.with_metadata(key.clone(), value.clone());
        }

        for stage in &self.stages {
            pipeline.add_stage(self.build_stage(stage, connectors, &registry)?)?;
        }
        debug!(pipeline_id = %self.id, stages = self.stages.len(), "Built pipeline from configuration");
        Ok(pipeline)
    }

    fn build_stage(
        &self,
        config: &StageConfiguration,
        connectors: &ConnectorRegistry,
        registry: &TransformationRegistry,
    ) -> Result<PipelineStage> {
        let mut stage = RecordStage::new(config.id.clone(), config.stage_type);
        if let Some(parallelism) = config.parallelism {
            stage = stage.with_parallelism(parallelism);
        }
        if let Some(name) = &config.name {
            stage = stage.with_name(name.clone());
        }
        if let Some(batch_size) = config.batch_size {
            stage = stage.with_batch_size(batch_size);
        }
        if let Some(name) = &config.source {
            let source = connectors.source(name).ok_or_else(|| {
                EtlError::Config(format!("stage '{}' refers to unknown source connector '{}'", config.id, name))
            })?;
            stage = stage.with_source(source);
        }
        if let Some(name) = &config.destination {
            let destination = connectors.destination(name).ok_or_else(|| {
                EtlError::Config(format!(
                    "stage '{}' refers to unknown destination connector '{}'",
                    config.id, name
                ))
            })?;
            stage = stage.with_destination(destination);
        }

        for processor in &config.processors {
            let processor = match processor {
                ProcessorConfiguration::Rules { rules } => {
                    Processor::Rules(Arc::new(RuleEngine::with_rules(registry.clone(), rules.clone())))
                }
                ProcessorConfiguration::Mapping(mapper) => Processor::Mapper(Arc::new(mapper.build())),
                ProcessorConfiguration::Transformation { name } => {
                    let transformation = registry.get(name).ok_or_else(|| {
                        EtlError::Config(format!("stage '{}' refers to unknown transformation '{}'", config.id, name))
                    })?;
                    Processor::Transformation(transformation)
                }
            };
            stage = stage.with_processor(processor);
        }

        let mut pipeline_stage = PipelineStage::from_stage(stage, config.order);
        pipeline_stage.conditions = config.conditions.clone();
        pipeline_stage.enabled = config.enabled;
        pipeline_stage.retry = config.retry;
        Ok(pipeline_stage)
    }
}
