//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod ledger;
mod storage;

pub use ledger::{
    LedgerConfig, ProviderConfig, ProvidersConfig, RateLimitConfig, ReferralConfig,
    SchedulerConfig, UsdQuotes,
};
pub use storage::{SqliteConfig, StorageBackend, StorageConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LEDGER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LEDGER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LEDGER_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Monetary defaults.
    pub ledger: LedgerConfig,
    /// Webhook provider secrets.
    pub providers: ProvidersConfig,
    /// Background job cadence.
    pub scheduler: SchedulerConfig,
    /// Request rate limits.
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create config for testing: in-memory storage, fixed secrets.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.backend = StorageBackend::Memory;
        config.providers.bitlabs.secret = "bitlabs-secret".to_string();
        config.providers.cpx_research.secret = "cpx-secret".to_string();
        config.providers.adgem.secret = "adgem-secret".to_string();
        config.providers.adgem_ban_secret = "adgem-ban-secret".to_string();
        config
    }
}
