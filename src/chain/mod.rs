//! Chain module - source-chain observation and outbound escrow calls
//!
//! This module provides:
//! - The `EventSource` seam the watcher polls, with an ethers-backed provider
//! - The `ChainWatcher` that owns the block watermark
//! - `DestinationChain` / `SourceChain` capabilities the resolver drives,
//!   backed by a signer gateway that holds the keys

pub mod gateway;
pub mod provider;
pub mod watcher;

pub use gateway::{CosmWasmDestination, EvmSourceGateway, SignerGateway};
pub use provider::ChainProvider;
pub use watcher::ChainWatcher;

use crate::error::{RelayerError, RelayerResult};
use crate::state::SwapId;

use async_trait::async_trait;
use ethers::types::{Bytes, H256, U256};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

/// Opaque transaction reference returned by a chain
pub type TxRef = String;

/// Undecoded escrow-factory log as delivered by an [`EventSource`]
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

/// Read access to the source chain's escrow factory logs
#[async_trait]
pub trait EventSource: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn current_height(&self) -> RelayerResult<u64>;

    /// Escrow-creation logs in the inclusive block range
    async fn escrow_events(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<RawEvent>>;

    async fn health_check(&self) -> bool {
        self.current_height().await.is_ok()
    }
}

/// Mirrored lock issued on the destination chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationLock {
    pub id: SwapId,
    pub hashlock: H256,
    pub recipient: String,
    pub amount: U256,
    pub expiry_height: u64,
}

/// Claim or withdrawal authorised by a revealed preimage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Release {
    pub id: SwapId,
    pub preimage: H256,
    pub recipient: Option<String>,
}

#[async_trait]
pub trait DestinationChain: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn lock(&self, request: &DestinationLock) -> RelayerResult<TxRef>;

    async fn claim(&self, request: &Release) -> RelayerResult<TxRef>;
}

#[async_trait]
pub trait SourceChain: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn withdraw(&self, request: &Release) -> RelayerResult<TxRef>;
}

/// Bound a chain call; an elapsed timer becomes a retryable `Timeout`
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> RelayerResult<T>
where
    F: Future<Output = RelayerResult<T>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RelayerError::Timeout {
            operation: operation.to_string(),
        }),
    };
    crate::metrics::record_chain_call(operation, started.elapsed(), result.is_ok());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed() {
        let result: RelayerResult<u64> = with_timeout("slow", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err, RelayerError::Timeout { operation: "slow".into() });
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout("fast", Duration::from_secs(1), async { Ok::<_, RelayerError>(7) }).await;
        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), 7);
    }
}
