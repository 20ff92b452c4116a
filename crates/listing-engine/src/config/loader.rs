use std::path::Path;

use crate::config::schema::EngineConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Picks the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("json") => Ok(ConfigFormat::Json),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content, format)
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
        ConfigFormat::Json => serde_json::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    let worker = &config.worker;
    if worker.concurrency == 0 {
        return Err(invalid("worker.concurrency must be at least 1"));
    }
    if worker.poll_interval_ms == 0 {
        return Err(invalid("worker.poll_interval_ms must be greater than 0"));
    }
    if worker.executor_timeout_secs == 0 {
        return Err(invalid("worker.executor_timeout_secs must be greater than 0"));
    }
    if worker.name.trim().is_empty() {
        return Err(invalid("worker.name must not be empty"));
    }

    let retry = &config.retry;
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(invalid(format!(
            "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            retry.base_delay_ms, retry.max_delay_ms
        )));
    }

    let reaper = &config.reaper;
    if reaper.interval_secs == 0 {
        return Err(invalid("reaper.interval_secs must be greater than 0"));
    }
    // A job still inside its executor timeout must never look abandoned.
    if reaper.stale_after_secs <= worker.executor_timeout_secs {
        return Err(invalid(format!(
            "reaper.stale_after_secs ({}) must exceed worker.executor_timeout_secs ({})",
            reaper.stale_after_secs, worker.executor_timeout_secs
        )));
    }

    if config.reconciler.interval_secs == Some(0) {
        return Err(invalid("reconciler.interval_secs must be greater than 0"));
    }

    if config.logging.level.trim().is_empty() {
        return Err(invalid("logging.level must not be empty"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;

    #[test]
    fn test_minimal_yaml() {
        let config = load_config_from_str("{}", ConfigFormat::Yaml).unwrap();
        assert_eq!(config.worker.concurrency, 3);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
worker:
  name: batch
  concurrency: 8
  poll_interval_ms: 500
retry:
  max_retries: 5
  base_delay_ms: 250
reaper:
  stale_after_secs: 900
reconciler:
  interval_secs: 120
logging:
  level: debug
  format: json
"#;
        let config = load_config_from_str(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.worker.name, "batch");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.executor_timeout_secs, 300);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 300_000);
        assert_eq!(config.reaper.stale_after_secs, 900);
        assert_eq!(config.reconciler.interval_secs, Some(120));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"database": {"path": "/var/lib/pipeline.db"}, "worker": {"concurrency": 1}}"#;
        let config = load_config_from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(
            config.database.path.as_deref(),
            Some(Path::new("/var/lib/pipeline.db"))
        );
        assert_eq!(config.worker.concurrency, 1);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = load_config_from_str("worker:\n  concurrency: 0\n", ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_stale_threshold_must_exceed_executor_timeout() {
        let yaml = "worker:\n  executor_timeout_secs: 600\nreaper:\n  stale_after_secs: 600\n";
        let err = load_config_from_str(yaml, ConfigFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("stale_after_secs"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = load_config_from_str("worker: [", ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ParseYaml(_)));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")).unwrap(), ConfigFormat::Json);
        assert!(ConfigFormat::from_path(Path::new("a.toml")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "worker:\n  concurrency: 2\n").unwrap();
        assert_eq!(load_config(&path).unwrap().worker.concurrency, 2);

        let missing = load_config(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::ReadFile { .. }));
    }
}
