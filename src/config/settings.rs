use etl_core::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub const DEFAULT_SETTINGS_PATH: &str = "etl.toml";

/// Process-wide engine settings.
///
/// Loaded from an optional TOML file, then overridden by `ETL_*` environment
/// variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Executions kept per pipeline id.
    pub history_retention: usize,
    pub max_degree_of_parallelism: usize,
    pub log_dir: PathBuf,
    pub log_file: String,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            history_retention: 100,
            max_degree_of_parallelism: 1,
            log_dir: PathBuf::from("logs"),
            log_file: "etl-engine.log".to_string(),
            log_filter: "etl_engine=debug,etl_core=debug,info".to_string(),
        }
    }
}

impl EngineSettings {
    /// Load `etl.toml` from the working directory when present.
    pub fn load() -> Result<Self> {
        let path = Path::new(DEFAULT_SETTINGS_PATH);
        let settings = if path.exists() {
            Self::load_from(path)?
        } else {
            Self::default()
        };
        settings.with_env_overrides()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EtlError::Config(format!("Failed to read settings file '{}': {}", path.display(), e))
        })?;
        let settings: EngineSettings = toml::from_str(&content).map_err(|e| {
            EtlError::Config(format!("Failed to parse settings file '{}': {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded engine settings");
        Ok(settings)
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(retention) = env_parse::<usize>("ETL_HISTORY_RETENTION")? {
            self.history_retention = retention;
        }
        if let Some(parallelism) = env_parse::<usize>("ETL_MAX_PARALLELISM")? {
            self.max_degree_of_parallelism = parallelism.max(1);
        }
        if let Ok(dir) = env::var("ETL_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(filter) = env::var("ETL_LOG_FILTER") {
            self.log_filter = filter;
        }
        Ok(self)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| EtlError::Config(format!("Invalid value '{}' for {}: {}", raw, key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "history_retention = 5").unwrap();
        let settings = EngineSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.history_retention, 5);
        assert_eq!(settings.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "history_retention = \"many\"").unwrap();
        let err = EngineSettings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_env_parse_reports_bad_values() {
        env::set_var("ETL_TEST_BAD_NUMBER", "ten");
        assert!(env_parse::<usize>("ETL_TEST_BAD_NUMBER").is_err());
        env::set_var("ETL_TEST_GOOD_NUMBER", " 7 ");
        assert_eq!(env_parse::<usize>("ETL_TEST_GOOD_NUMBER").unwrap(), Some(7));
        assert_eq!(env_parse::<usize>("ETL_TEST_UNSET_NUMBER").unwrap(), None);
    }
}
