//! Source chain provider with multi-RPC support and automatic failover

use super::{EventSource, RawEvent};
use crate::config::SourceChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::topics;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: SourceChainConfig,
    /// Escrow factory the logs are filtered on
    factory: Address,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: SourceChainConfig) -> RelayerResult<Self> {
        let factory = Address::from_str(&config.escrow_factory_address)
            .map_err(|e| RelayerError::Config(format!("Invalid escrow factory address: {}", e)))?;

        let mut http_providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainUnavailable {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            factory,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainUnavailable {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        })
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainUnavailable {
            chain_id: self.config.chain_id,
            message: "All providers failed to get logs".to_string(),
        })
    }

    /// Get escrow factory address
    pub fn factory_address(&self) -> Address {
        self.factory
    }
}

#[async_trait]
impl EventSource for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn current_height(&self) -> RelayerResult<u64> {
        self.get_block_number().await
    }

    async fn escrow_events(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<RawEvent>> {
        let filter = Filter::new()
            .address(self.factory)
            .topic0(*topics::SRC_ESCROW_CREATED)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.get_logs(&filter).await?;
        Ok(logs.into_iter().filter_map(raw_event).collect())
    }

    async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

/// Convert an RPC log, dropping logs the node flagged as removed by a reorg
fn raw_event(log: Log) -> Option<RawEvent> {
    if log.removed == Some(true) {
        debug!("Skipping removed log in tx {:?}", log.transaction_hash);
        return None;
    }

    Some(RawEvent {
        block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
        tx_hash: log.transaction_hash.unwrap_or_default(),
        topics: log.topics,
        data: log.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpc_urls: Vec<String>) -> SourceChainConfig {
        SourceChainConfig {
            chain_id: 27270,
            name: "ethereum".into(),
            rpc_urls,
            escrow_factory_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3".into(),
            gateway_url: "http://localhost:9100".into(),
            resolver_contract: "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".into(),
        }
    }

    #[test]
    fn test_failover_rotates_providers() {
        let provider = ChainProvider::new(config(vec![
            "http://localhost:8545".into(),
            "http://localhost:8546".into(),
        ]))
        .unwrap();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_rejects_bad_factory_address() {
        let mut cfg = config(vec!["http://localhost:8545".into()]);
        cfg.escrow_factory_address = "not-an-address".into();
        assert!(matches!(ChainProvider::new(cfg), Err(RelayerError::Config(_))));
    }

    #[test]
    fn test_removed_logs_are_dropped() {
        let log = Log {
            block_number: Some(12u64.into()),
            log_index: Some(3u64.into()),
            removed: Some(true),
            ..Default::default()
        };
        assert!(raw_event(log.clone()).is_none());

        let kept = raw_event(Log {
            removed: Some(false),
            ..log
        })
        .unwrap();
        assert_eq!((kept.block_number, kept.log_index), (12, 3));
    }
}
