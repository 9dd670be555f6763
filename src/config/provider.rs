use async_trait::async_trait;
use etl_core::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::pipeline_config::PipelineConfiguration;

/// Serialization formats for pipeline configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
    Xml,
}

impl ConfigFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            ConfigFormat::Yaml => "yaml",
            ConfigFormat::Toml => "toml",
            ConfigFormat::Xml => "xml",
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "json" => Some(ConfigFormat::Json),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "toml" => Some(ConfigFormat::Toml),
            "xml" => Some(ConfigFormat::Xml),
            _ => None,
        }
    }

    /// Guess from content: `{`/`[` is JSON, `<` is XML, any `:` is YAML, else JSON.
    pub fn sniff(content: &str) -> Self {
        let trimmed = content.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            ConfigFormat::Json
        } else if trimmed.starts_with('<') {
            ConfigFormat::Xml
        } else if trimmed.contains(':') {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Json
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension wins; content is sniffed otherwise.
pub fn detect_format(path: Option<&Path>, content: &str) -> ConfigFormat {
    path.and_then(ConfigFormat::from_extension)
        .unwrap_or_else(|| ConfigFormat::sniff(content))
}

fn unsupported(format: ConfigFormat) -> EtlError {
    EtlError::Config(format!("{} pipeline configuration is not supported", format))
}

pub fn parse_configuration(content: &str, format: ConfigFormat) -> Result<PipelineConfiguration> {
    let invalid = |e: &dyn fmt::Display| EtlError::Config(format!("invalid {} configuration: {}", format, e));
    match format {
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| invalid(&e)),
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| invalid(&e)),
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| invalid(&e)),
        ConfigFormat::Xml => Err(unsupported(format)),
    }
}

pub fn render_configuration(config: &PipelineConfiguration, format: ConfigFormat) -> Result<String> {
    let failed = |e: &dyn fmt::Display| EtlError::Config(format!("cannot render {} configuration: {}", format, e));
    match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config).map_err(|e| failed(&e)),
        ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(|e| failed(&e)),
        ConfigFormat::Toml => toml::to_string_pretty(config).map_err(|e| failed(&e)),
        ConfigFormat::Xml => Err(unsupported(format)),
    }
}

/// Loads and stores pipeline definitions.
///
/// `format: None` means detect it from the location and content.
#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
    async fn load_pipeline_configuration(
        &self,
        source: &str,
        format: Option<ConfigFormat>,
    ) -> Result<PipelineConfiguration>;

    async fn save_pipeline_configuration(
        &self,
        config: &PipelineConfiguration,
        destination: &str,
        format: Option<ConfigFormat>,
    ) -> Result<()>;
}

/// Reads and writes configuration files, relative to an optional base directory.
#[derive(Debug, Clone, Default)]
pub struct FileConfigurationProvider {
    base_dir: Option<PathBuf>,
}

impl FileConfigurationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(location),
            None => PathBuf::from(location),
        }
    }
}

#[async_trait]
impl ConfigurationProvider for FileConfigurationProvider {
    async fn load_pipeline_configuration(
        &self,
        source: &str,
        format: Option<ConfigFormat>,
    ) -> Result<PipelineConfiguration> {
        let path = self.resolve(source);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            EtlError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let format = format.unwrap_or_else(|| detect_format(Some(&path), &content));
        debug!(path = %path.display(), %format, "Parsing pipeline configuration");
        let config = parse_configuration(&content, format)?;
        info!("📂 Loaded pipeline '{}' from {}", config.id, path.display());
        Ok(config)
    }

    async fn save_pipeline_configuration(
        &self,
        config: &PipelineConfiguration,
        destination: &str,
        format: Option<ConfigFormat>,
    ) -> Result<()> {
        let path = self.resolve(destination);
        let format = format
            .or_else(|| ConfigFormat::from_extension(&path))
            .unwrap_or(ConfigFormat::Json);
        let rendered = render_configuration(config, format)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, rendered).await?;
        info!("💾 Saved pipeline '{}' to {}", config.id, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::pipeline_config::StageConfiguration;
    use crate::pipeline::StageType;
    use tempfile::TempDir;

    fn sample() -> PipelineConfiguration {
        serde_json::from_str(
            r#"{
                "id": "sample",
                "name": "Sample",
                "stages": [{"id": "extract", "stage_type": "extract", "order": 1, "source": "input"}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Some(Path::new("p.yml")), "{}"), ConfigFormat::Yaml);
        assert_eq!(detect_format(Some(Path::new("p.TOML")), ""), ConfigFormat::Toml);
        assert_eq!(detect_format(None, "  [1, 2]"), ConfigFormat::Json);
        assert_eq!(detect_format(None, "<pipeline/>"), ConfigFormat::Xml);
        assert_eq!(detect_format(Some(Path::new("pipeline")), "id: x"), ConfigFormat::Yaml);
        assert_eq!(detect_format(None, "plain"), ConfigFormat::Json);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = "id: y\nname: Yaml\nstages:\n  - id: s\n    stage_type: transform\n    order: 3\n";
        let config = parse_configuration(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.id, "y");
        assert_eq!(config.stages[0].order, 3);
        assert!(config.stages[0].enabled);
        assert_eq!(config.max_degree_of_parallelism, None);
    }

    #[test]
    fn test_xml_is_unsupported() {
        let err = parse_configuration("<pipeline/>", ConfigFormat::Xml).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
        assert!(render_configuration(&sample(), ConfigFormat::Xml).is_err());
    }

    #[test]
    fn test_malformed_json_names_the_format() {
        let err = parse_configuration("{ not json", ConfigFormat::Json).unwrap_err();
        assert!(err.to_string().contains("json"));
    }

    #[tokio::test]
    async fn test_file_provider_save_and_load() {
        let dir = TempDir::new().unwrap();
        let provider = FileConfigurationProvider::with_base_dir(dir.path());
        let mut config = sample();
        config.stages.push(StageConfiguration {
            id: "load".into(),
            name: Some("Load".into()),
            stage_type: StageType::Load,
            order: 2,
            enabled: true,
            conditions: Vec::new(),
            source: None,
            destination: Some("output".into()),
            processors: Vec::new(),
            batch_size: Some(50),
            parallelism: None,
            retry: None,
        });

        provider
            .save_pipeline_configuration(&config, "nested/pipeline.yaml", None)
            .await
            .unwrap();
        let loaded = provider
            .load_pipeline_configuration("nested/pipeline.yaml", None)
            .await
            .unwrap();
        assert_eq!(loaded.id, "sample");
        assert_eq!(loaded.stages.len(), 2);
        assert_eq!(loaded.stages[1].batch_size, Some(50));

        provider
            .save_pipeline_configuration(&config, "pipeline.json", None)
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("pipeline.json")).unwrap();
        assert!(raw.trim_start().starts_with('{'));
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let provider = FileConfigurationProvider::new();
        let err = provider
            .load_pipeline_configuration("/definitely/not/here.json", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }
}
