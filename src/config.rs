use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

use crate::product::Product;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the negotiator picks the teams that receive an OFFER for a resting buy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStrategy {
    /// Teams currently holding at least the requested quantity.
    #[default]
    InventoryHolders,
    /// Teams that sold the product during the last hour.
    RecentSellers,
}

/// Whether a PRODUCTION_UPDATE quantity is trusted as declared or bounded by the team's
/// computed yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionPolicy {
    #[default]
    ClientDeclared,
    CappedByYield,
}

/// Runtime settings for the venue. Every field has a default so a partial YAML file (or
/// none at all) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_addr: String,
    pub data_dir: String,
    pub log_level: String,
    /// Trade price used when neither side has a limit and no mid price is known.
    pub default_price: Decimal,
    /// Per-unit price assumed when checking whether a team can afford a MARKET buy.
    pub market_buy_estimate: Decimal,
    pub offer_timeout_ms: u64,
    pub offer_sweep_ms: u64,
    pub ticker_interval_ms: u64,
    pub orders_per_minute: u32,
    pub session_idle_timeout_secs: u64,
    pub store_timeout_ms: u64,
    pub store_retries: u32,
    pub candidate_strategy: CandidateStrategy,
    pub production_policy: ProductionPolicy,
    pub products: Vec<Product>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            data_dir: "data/exchange_db".to_string(),
            log_level: "info".to_string(),
            default_price: Decimal::from(10),
            market_buy_estimate: Decimal::from(15),
            offer_timeout_ms: 5_000,
            offer_sweep_ms: 100,
            ticker_interval_ms: 5_000,
            orders_per_minute: 60,
            session_idle_timeout_secs: 300,
            store_timeout_ms: 2_000,
            store_retries: 3,
            candidate_strategy: CandidateStrategy::default(),
            production_policy: ProductionPolicy::default(),
            products: Product::default_catalogue(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_price <= Decimal::ZERO {
            return Err(ConfigError::Invalid("default_price must be positive".into()));
        }
        if self.orders_per_minute == 0 {
            return Err(ConfigError::Invalid("orders_per_minute must be positive".into()));
        }
        if self.store_retries == 0 {
            return Err(ConfigError::Invalid("store_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn offer_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.offer_sweep_ms.max(1))
    }

    pub fn ticker_interval(&self) -> Duration {
        Duration::from_millis(self.ticker_interval_ms.max(1))
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
