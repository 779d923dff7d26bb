//! Application configuration.
//!
//! Aggregates server settings into a single [`Config`] struct loadable
//! from YAML files or environment variables.

use std::collections::HashMap;

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Advertised app name.
    pub name: String,
    /// Unique server id. Empty generates one at startup.
    pub id: String,
    /// Advertised app version.
    pub version: String,
    /// Bind address.
    pub address: String,
    /// Advertised address override.
    pub advertise: Option<String>,
    /// Registration domain.
    pub namespace: String,
    /// Registration TTL in seconds.
    pub register_ttl_secs: u64,
    /// Re-registration heartbeat interval in seconds.
    pub register_interval_secs: u64,
    /// Extra instance metadata.
    pub metadata: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "weft.server".to_string(),
            id: String::new(),
            version: "latest".to_string(),
            address: "127.0.0.1:0".to_string(),
            advertise: None,
            namespace: crate::registry::DEFAULT_DOMAIN.to_string(),
            register_ttl_secs: 90,
            register_interval_secs: 30,
            metadata: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `weft.yaml` in the current directory, if present
    /// 2. The file named by the `WEFT_CONFIG` environment variable
    /// 3. Environment variables with a `WEFT_` prefix
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("weft", FileFormat::Yaml).required(false))
            .add_source(File::new("weft.yaml", FileFormat::Yaml).required(false));

        if let Ok(config_path) = std::env::var("WEFT_CONFIG") {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("WEFT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
