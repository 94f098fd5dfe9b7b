use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use warden_core::engine::EngineConfig;
use warden_core::schema::SchemaLimits;

use crate::service::DepthPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfigValues,
    pub schema_limits: SchemaLimitsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub default_depth: u32,
    pub min_depth: u32,
    pub max_depth: u32,
    pub max_concurrent_branches: usize,
    /// Per-request deadline in milliseconds; zero disables it.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaLimitsConfig {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        Self {
            default_depth: 20,
            min_depth: 3,
            max_depth: 50,
            max_concurrent_branches: 10,
            timeout_ms: 0,
        }
    }
}

impl Default for SchemaLimitsConfig {
    fn default() -> Self {
        let limits = SchemaLimits::default();
        Self {
            max_types: limits.max_types,
            max_relations_per_type: limits.max_relations_per_type,
            max_permissions_per_type: limits.max_permissions_per_type,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Applies `WARDEN_*` overrides read through `var`. Unparseable numbers
    /// are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(n) = var("WARDEN_ENGINE_DEFAULT_DEPTH").and_then(|v| v.parse().ok()) {
            self.engine.default_depth = n;
        }
        if let Some(n) = var("WARDEN_ENGINE_MAX_DEPTH").and_then(|v| v.parse().ok()) {
            self.engine.max_depth = n;
        }
        if let Some(n) = var("WARDEN_ENGINE_MAX_CONCURRENT_BRANCHES").and_then(|v| v.parse().ok())
        {
            self.engine.max_concurrent_branches = n;
        }
        if let Some(n) = var("WARDEN_ENGINE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.engine.timeout_ms = n;
        }
        if let Some(v) = var("WARDEN_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("WARDEN_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.min_depth == 0 {
            return Err(ConfigError::Validation(
                "engine.min_depth must be non-zero".to_string(),
            ));
        }
        if engine.min_depth > engine.max_depth {
            return Err(ConfigError::Validation(
                "engine.min_depth must not exceed engine.max_depth".to_string(),
            ));
        }
        if !(engine.min_depth..=engine.max_depth).contains(&engine.default_depth) {
            return Err(ConfigError::Validation(
                "engine.default_depth must lie between min_depth and max_depth".to_string(),
            ));
        }
        if engine.max_concurrent_branches == 0 {
            return Err(ConfigError::Validation(
                "engine.max_concurrent_branches must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_concurrent_branches: self.engine.max_concurrent_branches,
        }
    }

    pub fn to_depth_policy(&self) -> DepthPolicy {
        DepthPolicy {
            default: self.engine.default_depth,
            min: self.engine.min_depth,
            max: self.engine.max_depth,
        }
    }

    pub fn to_schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_types: self.schema_limits.max_types,
            max_relations_per_type: self.schema_limits.max_relations_per_type,
            max_permissions_per_type: self.schema_limits.max_permissions_per_type,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.engine.timeout_ms > 0).then(|| Duration::from_millis(self.engine.timeout_ms))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_values() {
        let config = AppConfig::default();

        assert_eq!(config.engine.default_depth, 20);
        assert_eq!(config.engine.min_depth, 3);
        assert_eq!(config.engine.max_depth, 50);
        assert_eq!(config.engine.max_concurrent_branches, 10);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[engine]
default_depth = 10
timeout_ms = 250

[schema_limits]
max_types = 5

[log]
format = "pretty"
level = "debug"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.engine.default_depth, 10);
        assert_eq!(config.engine.max_depth, 50);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.to_schema_limits().max_types, 5);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = AppConfig::load(Some(&dir.path().join("absent.toml")));

        assert!(matches!(result, Err(ConfigError::ReadFile(..))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine\nmax_depth = ").unwrap();

        let result = AppConfig::load(Some(&path));

        assert!(matches!(result, Err(ConfigError::ParseToml(_))));
    }

    #[test]
    fn overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = [
            ("WARDEN_ENGINE_MAX_DEPTH", "30"),
            ("WARDEN_ENGINE_TIMEOUT_MS", "100"),
            ("WARDEN_LOG_FORMAT", "pretty"),
            ("WARDEN_ENGINE_DEFAULT_DEPTH", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();

        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.engine.max_depth, 30);
        assert_eq!(config.engine.default_depth, 20);
        assert_eq!(config.timeout(), Some(Duration::from_millis(100)));
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn validation_rejects_default_outside_range() {
        let mut config = AppConfig::default();
        config.engine.default_depth = 2;

        let result = config.validate();
        assert!(
            matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("default_depth"))
        );
    }

    #[test]
    fn validation_rejects_zero_branches() {
        let mut config = AppConfig::default();
        config.engine.max_concurrent_branches = 0;

        let result = config.validate();
        assert!(
            matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("branches"))
        );
    }

    #[test]
    fn converts_to_engine_settings() {
        let config = AppConfig::default();

        assert_eq!(config.to_engine_config().max_concurrent_branches, 10);
        assert_eq!(
            config.to_depth_policy(),
            DepthPolicy {
                default: 20,
                min: 3,
                max: 50
            }
        );
    }
}
