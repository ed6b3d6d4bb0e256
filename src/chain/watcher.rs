//! Bounded-window poller over the source chain's escrow-creation events

use super::{with_timeout, EventSource, RawEvent};
use crate::error::RelayerResult;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Polls an [`EventSource`] and tracks the last fully processed height.
///
/// The watermark only moves after a whole range was fetched; a failed poll
/// leaves it in place so the same range is requested again. After a long
/// outage the look-back is clamped to `max_history_window` blocks and the
/// gap is reported, events inside it are not recovered.
pub struct ChainWatcher {
    source: Arc<dyn EventSource>,
    max_history_window: u64,
    request_timeout: Duration,
    last_processed_block: RwLock<u64>,
}

impl ChainWatcher {
    pub fn new(
        source: Arc<dyn EventSource>,
        max_history_window: u64,
        request_timeout: Duration,
        start_block: Option<u64>,
    ) -> Self {
        Self {
            source,
            max_history_window,
            request_timeout,
            last_processed_block: RwLock::new(start_block.unwrap_or(0)),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.source.chain_id()
    }

    pub async fn watermark(&self) -> u64 {
        *self.last_processed_block.read().await
    }

    pub async fn health_check(&self) -> bool {
        self.source.health_check().await
    }

    /// Fetch events from the window after the watermark up to the chain head.
    ///
    /// Events come back ordered by block and log index. Provider failures
    /// surface as `ChainUnavailable` / `Timeout`; the watcher never retries.
    pub async fn poll(&self) -> RelayerResult<Vec<RawEvent>> {
        let chain_id = self.source.chain_id();
        let current_block = with_timeout(
            "source_block_number",
            self.request_timeout,
            self.source.current_height(),
        )
        .await?;

        let last_block = *self.last_processed_block.read().await;
        let next_block = last_block + 1;
        let window_start = current_block.saturating_sub(self.max_history_window);
        let from_block = next_block.max(window_start);

        if from_block > current_block {
            debug!("Chain {}: no new blocks (head {})", chain_id, current_block);
            return Ok(Vec::new());
        }

        if last_block > 0 && from_block > next_block {
            let skipped = from_block - next_block;
            warn!(
                "Chain {}: {} blocks ({}..{}) fell outside the {}-block history window and will not be scanned",
                chain_id,
                skipped,
                next_block,
                from_block - 1,
                self.max_history_window
            );
            crate::metrics::record_blocks_skipped(chain_id, skipped);
        }

        debug!(
            "Chain {}: Processing blocks {} to {}",
            chain_id, from_block, current_block
        );

        let mut events = with_timeout(
            "source_escrow_events",
            self.request_timeout,
            self.source.escrow_events(from_block, current_block),
        )
        .await?;
        events.sort_by_key(|e| (e.block_number, e.log_index));

        *self.last_processed_block.write().await = current_block;
        crate::metrics::record_blocks_processed(chain_id, current_block);

        Ok(events)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RelayerError;
    use async_trait::async_trait;
    use ethers::types::{Bytes, H256};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Scriptable in-memory chain
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub(crate) head: AtomicU64,
        pub(crate) height_calls: AtomicU64,
        pub(crate) down: AtomicBool,
        pub(crate) events: Mutex<Vec<RawEvent>>,
        pub(crate) queries: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeSource {
        pub(crate) fn at(head: u64) -> Self {
            let source = Self::default();
            source.head.store(head, Ordering::SeqCst);
            source
        }

        pub(crate) fn push(&self, event: RawEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl EventSource for FakeSource {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn current_height(&self) -> RelayerResult<u64> {
            self.height_calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(RelayerError::ChainUnavailable {
                    chain_id: 1,
                    message: "connection refused".into(),
                });
            }
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn escrow_events(&self, from: u64, to: u64) -> RelayerResult<Vec<RawEvent>> {
            self.queries.lock().unwrap().push((from, to));
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.block_number >= from && e.block_number <= to)
                .cloned()
                .collect())
        }
    }

    fn event(block: u64, index: u64) -> RawEvent {
        RawEvent {
            block_number: block,
            log_index: index,
            tx_hash: H256::from_low_u64_be(block * 100 + index),
            topics: vec![],
            data: Bytes::default(),
        }
    }

    fn watcher(source: Arc<FakeSource>, window: u64) -> ChainWatcher {
        ChainWatcher::new(source, window, Duration::from_secs(1), None)
    }

    #[tokio::test]
    async fn test_first_poll_is_clamped_to_window() {
        let source = Arc::new(FakeSource::at(500));
        let watcher = watcher(source.clone(), 100);

        watcher.poll().await.unwrap();
        assert_eq!(*source.queries.lock().unwrap(), vec![(400, 500)]);
        assert_eq!(watcher.watermark().await, 500);
    }

    #[tokio::test]
    async fn test_poll_resumes_after_watermark_in_order() {
        let source = Arc::new(FakeSource::at(50));
        let watcher = watcher(source.clone(), 100);
        watcher.poll().await.unwrap();

        source.push(event(53, 1));
        source.push(event(52, 0));
        source.push(event(53, 0));
        source.head.store(55, Ordering::SeqCst);

        let events = watcher.poll().await.unwrap();
        let order: Vec<_> = events.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(order, vec![(52, 0), (53, 0), (53, 1)]);
        assert_eq!(source.queries.lock().unwrap().last(), Some(&(51, 55)));
    }

    #[tokio::test]
    async fn test_no_new_blocks_is_empty_not_error() {
        let source = Arc::new(FakeSource::at(50));
        let watcher = watcher(source.clone(), 100);
        watcher.poll().await.unwrap();

        let events = watcher.poll().await.unwrap();
        assert!(events.is_empty());
        assert_eq!(source.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_watermark() {
        let source = Arc::new(FakeSource::at(50));
        let watcher = watcher(source.clone(), 100);
        watcher.poll().await.unwrap();

        source.head.store(60, Ordering::SeqCst);
        source.down.store(true, Ordering::SeqCst);
        let err = watcher.poll().await.unwrap_err();
        assert!(matches!(err, RelayerError::ChainUnavailable { .. }));
        assert_eq!(watcher.watermark().await, 50);

        source.down.store(false, Ordering::SeqCst);
        watcher.poll().await.unwrap();
        assert_eq!(source.queries.lock().unwrap().last(), Some(&(51, 60)));
    }

    #[tokio::test]
    async fn test_outage_longer_than_window_skips_gap() {
        let source = Arc::new(FakeSource::at(10));
        let watcher = watcher(source.clone(), 100);
        watcher.poll().await.unwrap();

        source.push(event(20, 0));
        source.push(event(950, 0));
        source.head.store(1000, Ordering::SeqCst);

        let events = watcher.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_number, 950);
        assert_eq!(source.queries.lock().unwrap().last(), Some(&(900, 1000)));
    }

    #[tokio::test]
    async fn test_start_block_seeds_watermark() {
        let source = Arc::new(FakeSource::at(120));
        let watcher = ChainWatcher::new(source.clone(), 100, Duration::from_secs(1), Some(110));
        assert_eq!(watcher.watermark().await, 110);
        watcher.poll().await.unwrap();
        assert_eq!(*source.queries.lock().unwrap(), vec![(111, 120)]);
    }
}
