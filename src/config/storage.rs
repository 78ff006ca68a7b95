//! Storage configuration types.

use serde::Deserialize;

/// Storage backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend discriminator.
    #[serde(rename = "type")]
    pub backend: StorageBackend,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file.
    pub path: String,
    /// How long a writer waits on a locked database before reporting a conflict.
    pub busy_timeout_ms: u64,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "./data/ledger.db".to_string(),
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}
