use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use switchboard_sfu::SfuConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Room used when a client connects without `room`
    pub default_room: String,
    /// Largest signaling frame accepted, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            default_room: "default".to_string(),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SWITCHBOARD_SFU__NEGOTIATION_DEBOUNCE_MS=80`.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SWITCHBOARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check every section, returning all problems found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.default_room.is_empty() {
            errors.push("server.default_room must not be empty".to_string());
        }
        if self.server.max_message_size < 1024 {
            errors.push("server.max_message_size must be at least 1024 bytes".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Resolve and load the configuration file
///
/// Search order:
/// 1. explicit path (`--config` / `SWITCHBOARD_CONFIG_PATH`)
/// 2. ./config.yaml
/// 3. environment variables only
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    let path = explicit
        .map(str::to_string)
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    let config = match path {
        Some(path) => {
            if !Path::new(&path).exists() {
                anyhow::bail!("Config file not found: {path}");
            }
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::load(None)?
        }
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        );
    }

    Ok(config)
}
