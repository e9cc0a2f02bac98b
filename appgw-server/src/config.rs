//! Server configuration.
//!
//! One YAML document (path from `APPGW_CONFIG`, default `appgw.yaml`) holds
//! the listen endpoint, the resolution rule list, and the telemetry
//! settings. `.env` files are loaded first and a couple of scalar settings
//! can be overridden from the environment, so deployments can retarget an
//! image without editing the document.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use appgw_core::RuleDef;
use appgw_telemetry::TelemetryFormat;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Io(String),
    /// The document is not valid YAML or has the wrong shape.
    Parse(String),
    /// The document parsed but carries an unusable value.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config read error: {msg}"),
            ConfigError::Parse(msg) => write!(f, "config parse error: {msg}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_endpoint() -> String {
    "127.0.0.1:9005".to_string()
}

fn default_suffix() -> String {
    ".listen".to_string()
}

fn default_interval() -> u64 {
    60
}

fn default_threshold() -> u32 {
    25
}

/// Telemetry section of the config document.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_interval")]
    pub reporting_interval_secs: u64,
    #[serde(default = "default_threshold")]
    pub cache_threshold: u32,
    #[serde(default)]
    pub format: TelemetryFormat,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            reporting_interval_secs: default_interval(),
            cache_threshold: default_threshold(),
            format: TelemetryFormat::default(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_suffix")]
    pub subscription_suffix: String,
    #[serde(default)]
    pub resolution: Vec<RuleDef>,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    /// Session token → app id table consumed by the dev host authenticator.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl GatewayConfig {
    /// Load the document named by `APPGW_CONFIG` (default `appgw.yaml`),
    /// apply environment overrides, and validate.
    pub fn load() -> Result<Self, ConfigError> {
        // `.env` files never overwrite already-set environment variables.
        let _ = dotenvy::dotenv();
        let path = std::env::var("APPGW_CONFIG").unwrap_or_else(|_| "appgw.yaml".to_string());
        let mut config = Self::load_from(Path::new(&path))?;

        if let Ok(endpoint) = std::env::var("APPGW_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(format) = std::env::var("APPGW_TELEMETRY_FORMAT") {
            config.telemetry.format = format.parse().map_err(ConfigError::Invalid)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        if self.subscription_suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "subscription_suffix must not be empty".into(),
            ));
        }
        if self.telemetry.reporting_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.reporting_interval_secs must be positive".into(),
            ));
        }
        if self.telemetry.cache_threshold == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.cache_threshold must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for rule in &self.resolution {
            if !seen.insert(rule.method.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate resolution rule for method '{}'",
                    rule.method
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
endpoint: "127.0.0.1:9005"
resolution:
  - method: device.name
    alias: org.rdk.Device
    direct: true
  - method: device.nameChanged
    alias: device.nameChanged
    event: nameChanged
telemetry:
  reporting_interval_secs: 30
  cache_threshold: 10
  format: compact
tokens:
  TKN-A: app-1
"#;

    #[test]
    fn parses_full_document() {
        let config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.endpoint, "127.0.0.1:9005");
        assert_eq!(config.subscription_suffix, ".listen");
        assert_eq!(config.resolution.len(), 2);
        assert_eq!(config.telemetry.reporting_interval_secs, 30);
        assert_eq!(config.telemetry.format, TelemetryFormat::Compact);
        assert_eq!(config.tokens["TKN-A"], "app-1");
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = GatewayConfig::from_yaml("endpoint: \"127.0.0.1:0\"").unwrap();
        assert!(config.resolution.is_empty());
        assert_eq!(config.telemetry.cache_threshold, 25);
        assert_eq!(config.telemetry.format, TelemetryFormat::Json);
    }

    #[test]
    fn duplicate_methods_fail_validation() {
        let config = GatewayConfig::from_yaml(
            r#"
resolution:
  - method: device.name
    alias: a
  - method: device.name
    alias: b
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_interval_fails_validation() {
        let config = GatewayConfig::from_yaml(
            r#"
telemetry:
  reporting_interval_secs: 0
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appgw.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = GatewayConfig::load_from(&path).unwrap();
        assert_eq!(config.resolution.len(), 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = GatewayConfig::load_from(Path::new("/nonexistent/appgw.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
