//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::defaults::{
    default_inventory_modules, DEFAULT_BATCH_SIZE, DEFAULT_DEDUP_CACHE_MAX, DEFAULT_IMMEDIATE_IMPORT_LIMIT,
    DEFAULT_PREVIEW_LIMIT,
};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// PostgreSQL connection string (optional, falls back to in-memory stores if unset)
    pub database_url: Option<String>,

    pub database_max_connections: u32,

    /// JWT secret key for token validation
    pub jwt_secret: Option<String>,

    pub import: ImportSettings,
}

/// Import pipeline tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSettings {
    /// Staged row count above which an import is deferred to the scheduler
    pub immediate_limit: u64,
    /// Dedup cache ceiling per import run
    pub dedup_cache_max: usize,
    pub preview_limit: usize,
    pub batch_size: usize,
    /// Modules whose rows are line fragments grouped by subject
    pub inventory_modules: Vec<String>,
    /// In-process resume loop for scheduled jobs; off when `None`
    pub scheduler_interval: Option<Duration>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            immediate_limit: DEFAULT_IMMEDIATE_IMPORT_LIMIT,
            dedup_cache_max: DEFAULT_DEDUP_CACHE_MAX,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            inventory_modules: default_inventory_modules(),
            scheduler_interval: None,
        }
    }
}

impl ImportSettings {
    pub fn is_inventory_module(&self, module: &str) -> bool {
        self.inventory_modules.iter().any(|m| m == module)
    }

    /// Read `IMPORT_*` variables, keeping defaults for unset ones
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let inventory_modules = match std::env::var("IMPORT_INVENTORY_MODULES") {
            Ok(list) => parse_module_list(&list),
            Err(_) => defaults.inventory_modules,
        };

        let scheduler_interval = optional_env::<u64>("IMPORT_SCHEDULER_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            immediate_limit: optional_env("IMPORT_IMMEDIATE_LIMIT")?.unwrap_or(defaults.immediate_limit),
            dedup_cache_max: optional_env("IMPORT_DEDUP_CACHE_MAX")?.unwrap_or(defaults.dedup_cache_max),
            preview_limit: optional_env("IMPORT_PREVIEW_LIMIT")?.unwrap_or(defaults.preview_limit),
            batch_size: optional_env::<usize>("IMPORT_BATCH_SIZE")?
                .unwrap_or(defaults.batch_size)
                .max(1),
            inventory_modules,
            scheduler_interval,
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url = std::env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let database_url = std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let database_max_connections = optional_env("DATABASE_MAX_CONNECTIONS")?.unwrap_or(10);

        let jwt_secret = std::env::var("JWT_SECRET").ok();

        Ok(Self {
            nats_url,
            database_url,
            database_max_connections,
            jwt_secret,
            import: ImportSettings::from_env()?,
        })
    }

    /// JWT secret for serving requests. Must be at least 32 bytes.
    pub fn require_jwt_secret(&self) -> Result<&str> {
        let secret = self
            .jwt_secret
            .as_deref()
            .context("JWT_SECRET must be set, generate one with: openssl rand -base64 48")?;

        if secret.len() < 32 {
            anyhow::bail!(
                "JWT_SECRET must be at least 32 bytes (current: {} bytes). Generate one with: openssl rand -base64 48",
                secret.len()
            );
        }
        Ok(secret)
    }
}

fn parse_module_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an optional variable; a present but malformed value is an error
fn optional_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", name, raw, e)),
        _ => Ok(None),
    }
}
