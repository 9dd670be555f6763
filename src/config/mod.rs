pub mod pipeline_config;
pub mod provider;
pub mod settings;

pub use pipeline_config::{
    ConnectorRegistry, MapperConfiguration, PipelineConfiguration, ProcessorConfiguration, StageConfiguration,
};
pub use provider::{
    detect_format, parse_configuration, render_configuration, ConfigFormat, ConfigurationProvider,
    FileConfigurationProvider,
};
pub use settings::{EngineSettings, DEFAULT_SETTINGS_PATH};
