//! Configuration management

use crate::api::DEFAULT_BASE_URL;
use stopsearch_common::forces;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/stopsearch";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default forces to ingest when `POLICE_FORCES` is unset.
pub const DEFAULT_FORCES: &str = "metropolitan";

/// Ingestion configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    /// Upstream API base URL (overridable for tests).
    pub api_base_url: String,
    /// Forces to ingest, each one of the known force identifiers.
    pub forces: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = IngestConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: std::env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: std::env::var("DATABASE_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            },
            api_base_url: std::env::var("POLICE_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            forces: std::env::var("POLICE_FORCES")
                .unwrap_or_else(|_| DEFAULT_FORCES.to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.api_base_url.is_empty() {
            anyhow::bail!("API base URL cannot be empty");
        }

        if self.forces.is_empty() {
            anyhow::bail!("At least one police force must be configured");
        }

        for force in &self.forces {
            forces::validate_force(force)
                .map_err(|_| anyhow::anyhow!("Unknown police force in POLICE_FORCES: {force}"))?;
        }

        Ok(())
    }
}
