//! Configuration management for the escrow relayer
//!
//! Loads configuration from a TOML file with `${VAR}` substitution, then applies
//! `ESCROW_RELAYER__SECTION__KEY` environment overrides.

use crate::chain::EscrowContract;
use crate::error::RelayerError;
use crate::events::cardano::Point;

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    pub ethereum: Option<EvmConfig>,
    pub cardano: Option<CardanoConfig>,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
        }
    }
}

fn default_instance_id() -> String {
    format!("relayer-{}", uuid::Uuid::new_v4())
}

/// Stream reconnection policy shared by both watchers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_attempts: 10,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmConfig {
    pub ws_url: String,
    #[serde(default)]
    pub contracts: Vec<EscrowContract>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardanoConfig {
    pub ogmios_url: String,
    /// Where chain-sync starts when there is no resume point; origin when unset
    pub start_point: Option<Point>,
    #[serde(default)]
    pub contracts: Vec<EscrowContract>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub auto_settle: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auto_settle: true,
            max_retries: 3,
            retry_delay_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    #[default]
    DryRun,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutorMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `ESCROW_RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("ESCROW_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file, applying environment overrides
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(
                &config_str,
                config::FileFormat::Toml,
            ))
            .add_source(
                config::Environment::with_prefix("ESCROW_RELAYER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| "Failed to build configuration")?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Parse settings from a TOML string without environment overrides
    #[cfg(test)]
    pub fn parse(input: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(&substitute_env_vars(input))
            .with_context(|| "Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.ethereum.is_none() && self.cardano.is_none() {
            bail!(RelayerError::Config(
                "At least one of [ethereum] or [cardano] must be configured".into()
            ));
        }

        if let Some(evm) = &self.ethereum {
            if evm.ws_url.is_empty() {
                bail!(RelayerError::Config("ethereum.ws_url must not be empty".into()));
            }
            if evm.contracts.is_empty() {
                tracing::warn!("No EVM escrow contracts configured - watcher will idle");
            }
        }

        if let Some(cardano) = &self.cardano {
            if cardano.ogmios_url.is_empty() {
                bail!(RelayerError::Config("cardano.ogmios_url must not be empty".into()));
            }
        }

        if self.coordinator.max_retries == 0 {
            bail!(RelayerError::Config("coordinator.max_retries must be at least 1".into()));
        }
        if self.reconnect.max_attempts == 0 {
            bail!(RelayerError::Config("reconnect.max_attempts must be at least 1".into()));
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
