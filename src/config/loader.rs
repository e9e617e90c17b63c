use crate::common::error::{LoopError, Result};
use crate::config::models::Config;

/// Load and validate configuration from file
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file path
    pub fn load(path: &str) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoopError::ConfigError(format!("reading {} failed: {}", path, e))
        })?;
        Self::load_from_str(&content)
    }

    /// Load configuration from string (useful for testing)
    pub fn load_from_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)
            .map_err(|e| LoopError::ConfigError(e.to_string()))?;
        validate_config(&config)?;
        Ok(config)
    }
}

fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        return Err(LoopError::ConfigError(
            "server port must be non-zero".to_string(),
        ));
    }
    if config.server.rx_capacity == 0 || config.server.tx_capacity == 0 {
        return Err(LoopError::ConfigError(
            "buffer capacities must be non-zero".to_string(),
        ));
    }
    if config.engine.max_events == 0 {
        return Err(LoopError::ConfigError(
            "max_events must be non-zero".to_string(),
        ));
    }
    match config.engine.log_level.as_str() {
        "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
        other => Err(LoopError::ConfigError(format!(
            "unknown log level: {}",
            other
        ))),
    }
}
