//! Configuration management for the Civic Sync server

use std::collections::HashMap;
use std::env;

use serde::Deserialize;

use crate::entities::EntityType;
use crate::sync::{ConflictStrategy, FieldPolicy, MergePolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Tunables of the sync engine
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Retries before a transient failure becomes permanent
    pub max_retries: i64,
    /// A device whose last sync is older than this is reported as stale
    pub stale_after_hours: i64,
    pub default_page_size: i64,
    pub max_page_size: i64,
    /// Entity groups applied in parallel within one upload batch
    pub apply_concurrency: usize,
    /// Seconds after which an `applying` action may be reclaimed
    pub applying_lease_secs: i64,
    pub strategies: HashMap<EntityType, ConflictStrategy>,
    pub merge_policies: HashMap<EntityType, MergePolicy>,
}

impl SyncConfig {
    pub fn strategy_for(&self, entity_type: EntityType) -> ConflictStrategy {
        self.strategies
            .get(&entity_type)
            .copied()
            .unwrap_or(ConflictStrategy::ServerWins)
    }

    pub fn merge_policy_for(&self, entity_type: EntityType) -> MergePolicy {
        self.merge_policies
            .get(&entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Clamp a requested page size into the allowed range
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_retries: 5,
            stale_after_hours: 24,
            default_page_size: 100,
            max_page_size: 500,
            apply_concurrency: 4,
            applying_lease_secs: 300,
            strategies: HashMap::new(),
            merge_policies: HashMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./civic_sync.db".to_string(),
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = SyncConfig::default();

        let mut strategies = HashMap::new();
        let mut merge_policies = HashMap::new();
        for entity_type in EntityType::ALL {
            let suffix = entity_type.as_str().to_uppercase();

            if let Ok(value) = env::var(format!("SYNC_STRATEGY_{}", suffix)) {
                match value.parse::<ConflictStrategy>() {
                    Ok(strategy) => {
                        strategies.insert(entity_type, strategy);
                    }
                    Err(_) => tracing::warn!(
                        "Ignoring unknown conflict strategy {:?} for {}",
                        value,
                        entity_type
                    ),
                }
            }

            if let Ok(value) = env::var(format!("SYNC_MANUAL_FIELDS_{}", suffix)) {
                let mut policy = MergePolicy::default();
                for field in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                    policy.fields.insert(field.to_string(), FieldPolicy::Manual);
                }
                merge_policies.insert(entity_type, policy);
            }
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:./civic_sync.db".to_string()),
            },
            sync: SyncConfig {
                max_retries: env_parse("SYNC_MAX_RETRIES", defaults.max_retries),
                stale_after_hours: env_parse("SYNC_STALE_AFTER_HOURS", defaults.stale_after_hours),
                default_page_size: env_parse("SYNC_PAGE_SIZE", defaults.default_page_size),
                max_page_size: env_parse("SYNC_MAX_PAGE_SIZE", defaults.max_page_size),
                apply_concurrency: env_parse("SYNC_APPLY_CONCURRENCY", defaults.apply_concurrency)
                    .max(1),
                applying_lease_secs: env_parse(
                    "SYNC_APPLYING_LEASE_SECS",
                    defaults.applying_lease_secs,
                ),
                strategies,
                merge_policies,
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
