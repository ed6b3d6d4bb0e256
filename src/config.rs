//! Configuration management for the escrow relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::HashAlgorithm;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub resolver: ResolverConfig,
    pub ledger: LedgerConfig,
    pub source: SourceChainConfig,
    pub destination: DestinationChainConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Static source-maker -> destination-recipient table
    #[serde(default)]
    pub recipients: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    /// Maximum number of blocks the watcher looks back from the chain head
    pub max_history_window: u64,
    pub request_timeout_ms: u64,
    /// Seed for the watermark; blocks up to and including it are skipped
    #[serde(default)]
    pub start_block: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub tick_interval_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
    pub funding_timeout_secs: u64,
    pub claim_timeout_secs: u64,
    pub max_concurrent_swaps: usize,
    #[serde(default = "default_true")]
    pub auto_settle: bool,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub capacity: usize,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Age after which an active record shows up in the stuck listing
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub escrow_factory_address: String,
    pub gateway_url: String,
    pub resolver_contract: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub gateway_url: String,
    pub cw20_contract: String,
    pub escrow_contract: String,
    pub expiry_height: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_webhook_backoff")]
    pub backoff_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_webhook_timeout(),
            retries: 0,
            backoff_ms: default_webhook_backoff(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_webhook_backoff() -> u64 {
    250
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ResolverConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn funding_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.funding_timeout_secs as i64)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_secs as i64)
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
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

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.source.rpc_urls.is_empty() {
            anyhow::bail!("Source chain {} has no RPC URLs configured", self.source.name);
        }
        if self.source.escrow_factory_address.is_empty() {
            anyhow::bail!("Source chain {} has no escrow factory address", self.source.name);
        }
        if self.destination.escrow_contract.is_empty() || self.destination.cw20_contract.is_empty()
        {
            anyhow::bail!(
                "Destination chain {} needs both escrow and cw20 contracts",
                self.destination.name
            );
        }
        if self.ledger.capacity == 0 {
            anyhow::bail!("Ledger capacity must be greater than zero");
        }
        if self.relayer.max_history_window == 0 {
            anyhow::bail!("max_history_window must be greater than zero");
        }
        if self.resolver.max_attempts == 0 {
            anyhow::bail!("resolver.max_attempts must be greater than zero");
        }
        if self.resolver.max_concurrent_swaps == 0 {
            anyhow::bail!("resolver.max_concurrent_swaps must be greater than zero");
        }
        if self.resolver.funding_timeout_secs.saturating_mul(1000) <= self.resolver.request_timeout_ms {
            anyhow::bail!(
                "resolver.funding_timeout_secs ({}s) must exceed resolver.request_timeout_ms ({}ms)",
                self.resolver.funding_timeout_secs,
                self.resolver.request_timeout_ms
            );
        }
        if self.notifications.webhook_url.is_none() {
            tracing::info!("No webhook configured - notifications disabled");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
