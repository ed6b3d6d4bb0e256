//! Ingestion task: watcher polling, ledger inserts, eviction sweeps

use crate::chain::ChainWatcher;
use crate::clock::Clock;
use crate::config::{LedgerConfig, RelayerConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::decode_escrow_created;
use crate::notify::{Notification, NotificationSink};
use crate::state::{
    EvictionReport, LedgerStats, LifecycleState, SwapLedger, SwapRecord, SwapUpdate,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub observed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub decode_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayerStatus {
    pub chain_id: u64,
    pub watermark: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub chain_available: bool,
    pub ledger: LedgerStats,
}

#[derive(Debug, Default)]
struct PollState {
    last_poll_at: Option<DateTime<Utc>>,
    chain_available: bool,
}

/// Turns source-chain escrow events into ledger records
pub struct EscrowRelayer {
    watcher: ChainWatcher,
    ledger: Arc<SwapLedger>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: RelayerConfig,
    ledger_config: LedgerConfig,
    poll_state: RwLock<PollState>,
    shutdown: Arc<RwLock<bool>>,
}

impl EscrowRelayer {
    pub fn new(
        watcher: ChainWatcher,
        ledger: Arc<SwapLedger>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: RelayerConfig,
        ledger_config: LedgerConfig,
    ) -> Self {
        Self {
            watcher,
            ledger,
            sink,
            clock,
            config,
            ledger_config,
            poll_state: RwLock::new(PollState::default()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn ledger(&self) -> &Arc<SwapLedger> {
        &self.ledger
    }

    /// Poll once and ingest whatever the watcher returned.
    ///
    /// Undecodable events are skipped, replays of known ids leave the ledger
    /// untouched. A watcher error is returned as is.
    pub async fn tick(&self) -> RelayerResult<IngestReport> {
        let result = self.watcher.poll().await;
        {
            let mut state = self.poll_state.write().await;
            state.last_poll_at = Some(self.clock.now());
            state.chain_available = result.is_ok();
        }
        crate::metrics::record_chain_health(self.watcher.chain_id(), result.is_ok());
        let events = result?;

        let chain_id = self.watcher.chain_id();
        let mut report = IngestReport {
            observed: events.len(),
            ..Default::default()
        };

        for raw in events {
            let created = match decode_escrow_created(&raw) {
                Ok(created) => created,
                Err(e) => {
                    warn!(
                        "Skipping undecodable event at block {} (tx {:?}): {}",
                        raw.block_number, raw.tx_hash, e
                    );
                    report.decode_failures += 1;
                    crate::metrics::record_event(chain_id, "decode_failed");
                    continue;
                }
            };

            let record = created.into_record(self.clock.now());
            let snapshot = record.snapshot();
            if self.ledger.insert_if_absent(record) {
                info!(
                    swap_id = %snapshot.id,
                    "New escrow detected at block {} (amount {}, destination chain {})",
                    snapshot.source_block,
                    snapshot.source.amount,
                    snapshot.destination.chain_id
                );
                report.inserted += 1;
                crate::metrics::record_event(chain_id, "inserted");
                self.dispatch(Notification::new_escrow(snapshot));
            } else {
                debug!("{}", RelayerError::DuplicateEvent { id: snapshot.id });
                report.duplicates += 1;
                crate::metrics::record_event(chain_id, "duplicate");
            }
        }

        Ok(report)
    }

    /// Hand a notification to the sink without waiting on it
    fn dispatch(&self, notification: Notification) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match sink.notify(&notification).await {
                Ok(()) => crate::metrics::record_notification(true),
                Err(e) => {
                    warn!("Notification for {} failed: {}", notification.data.id, e);
                    crate::metrics::record_notification(false);
                }
            }
        });
    }

    /// Evict with the injected clock
    pub fn sweep(&self) -> EvictionReport {
        self.ledger.evict(
            self.clock.now(),
            self.ledger_config.retention(),
            self.ledger_config.capacity,
        )
    }

    pub fn pending(&self) -> Vec<SwapRecord> {
        self.ledger.pending()
    }

    /// Records in `state`, or every record, oldest first
    pub fn list(&self, state: Option<LifecycleState>) -> Vec<SwapRecord> {
        match state {
            Some(state) => self.ledger.in_state(state),
            None => self.ledger.all(),
        }
    }

    pub fn get(&self, id: &str) -> RelayerResult<SwapRecord> {
        self.ledger.get(id)
    }

    /// Records that sat too long, carry an error, or were abandoned
    pub fn stuck(&self) -> Vec<SwapRecord> {
        self.ledger
            .stuck(self.clock.now(), self.ledger_config.stale_after())
    }

    /// Close a swap whose source escrow was withdrawn
    pub fn mark_processed(&self, id: &str) -> RelayerResult<SwapRecord> {
        let record = self.ledger.transition(
            id,
            LifecycleState::SourceWithdrawn,
            LifecycleState::Processed,
            SwapUpdate::new().clear_error(),
        )?;
        info!(swap_id = %id, "Swap processed");
        Ok(record)
    }

    pub async fn status(&self) -> RelayerStatus {
        let state = self.poll_state.read().await;
        RelayerStatus {
            chain_id: self.watcher.chain_id(),
            watermark: self.watcher.watermark().await,
            last_poll_at: state.last_poll_at,
            chain_available: state.chain_available,
            ledger: self.ledger.stats(),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.watcher.health_check().await
    }

    /// Main relayer loop
    pub async fn run(&self) -> RelayerResult<()> {
        let mut poll_interval = interval(self.config.poll_interval());
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sweep_interval = interval(self.ledger_config.sweep_interval());
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Escrow relayer started on chain {} (window {} blocks)",
            self.watcher.chain_id(),
            self.config.max_history_window
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report.observed > 0 => debug!("Ingested {:?}", report),
                        Ok(_) => {}
                        Err(e) if e.is_retryable() => self.reconnect(e).await,
                        Err(e) => error!("Error polling source chain: {}", e),
                    }
                }

                _ = sweep_interval.tick() => {
                    self.sweep();
                }
            }
        }

        info!("Escrow relayer stopped");
        Ok(())
    }

    /// Back off once, try one more poll, then fall back to the regular cadence
    async fn reconnect(&self, cause: RelayerError) {
        let backoff = self.config.reconnect_backoff();
        warn!(
            "Source chain unavailable ({}), retrying in {:?}",
            cause, backoff
        );
        tokio::time::sleep(backoff).await;

        match self.tick().await {
            Ok(report) => info!("Source chain reconnected, ingested {:?}", report),
            Err(e) => warn!("Reconnection attempt failed: {}", e),
        }
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Escrow relayer shutdown initiated");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::watcher::tests::FakeSource;
    use crate::clock::ManualClock;
    use crate::events::tests::EventFixture;
    use crate::notify::tests::RecordingSink;
    use crate::state::HashAlgorithm;
    use ethers::types::H256;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    pub(crate) fn relayer_config() -> RelayerConfig {
        RelayerConfig {
            poll_interval_ms: 1_000,
            reconnect_backoff_ms: 10_000,
            max_history_window: 100,
            request_timeout_ms: 1_000,
            start_block: None,
        }
    }

    pub(crate) fn ledger_config(capacity: usize) -> LedgerConfig {
        LedgerConfig {
            capacity,
            retention_secs: 3600,
            sweep_interval_secs: 300,
            stale_after_secs: 1800,
        }
    }

    pub(crate) struct Harness {
        pub(crate) source: Arc<FakeSource>,
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) ledger: Arc<SwapLedger>,
        pub(crate) sink: Arc<RecordingSink>,
        pub(crate) relayer: Arc<EscrowRelayer>,
    }

    pub(crate) fn harness(sink: RecordingSink) -> Harness {
        let source = Arc::new(FakeSource::at(50));
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(SwapLedger::new(HashAlgorithm::Sha256, clock.clone()));
        let sink = Arc::new(sink);
        let config = relayer_config();
        let watcher = ChainWatcher::new(
            source.clone(),
            config.max_history_window,
            config.request_timeout(),
            None,
        );
        let relayer = Arc::new(EscrowRelayer::new(
            watcher,
            ledger.clone(),
            sink.clone(),
            clock.clone(),
            config,
            ledger_config(100),
        ));
        Harness {
            source,
            clock,
            ledger,
            sink,
            relayer,
        }
    }

    async fn wait_for_notifications(sink: &RecordingSink, count: usize) {
        for _ in 0..100 {
            if sink.seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} notifications", count);
    }

    #[tokio::test]
    async fn test_tick_inserts_and_notifies() {
        let h = harness(RecordingSink::default());
        h.source.push(EventFixture::new(0x01, H256::repeat_byte(0x99)).raw());

        let report = h.relayer.tick().await.unwrap();
        assert_eq!(
            report,
            IngestReport {
                observed: 1,
                inserted: 1,
                duplicates: 0,
                decode_failures: 0
            }
        );

        let id = format!("0x{}", "01".repeat(32));
        assert_eq!(h.relayer.get(&id).unwrap().state, LifecycleState::Detected);
        assert_eq!(h.relayer.pending().len(), 1);

        wait_for_notifications(&h.sink, 1).await;
        let seen = h.sink.seen.lock().unwrap();
        assert_eq!(seen[0].kind, "new_escrow");
        assert_eq!(seen[0].data.id, id);
    }

    #[tokio::test]
    async fn test_replayed_event_is_ingested_once() {
        let h = harness(RecordingSink::default());
        let event = EventFixture::new(0x01, H256::repeat_byte(0x99));
        h.source.push(event.raw());
        h.relayer.tick().await.unwrap();

        // Same log observed again in a later range
        let mut replay = event;
        replay.block_number = 55;
        h.source.push(replay.raw());
        h.source.head.store(60, Ordering::SeqCst);

        let report = h.relayer.tick().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(h.ledger.len(), 1);
        assert_eq!(h.ledger.pending()[0].source_block, 42);
    }

    #[tokio::test]
    async fn test_undecodable_event_is_skipped() {
        let h = harness(RecordingSink::default());
        let mut bad = EventFixture::new(0x02, H256::repeat_byte(0x99)).raw();
        bad.topics = vec![H256::repeat_byte(0x12)];
        h.source.push(bad);
        h.source.push(EventFixture::new(0x01, H256::repeat_byte(0x99)).raw());

        let report = h.relayer.tick().await.unwrap();
        assert_eq!(report.observed, 2);
        assert_eq!(report.decode_failures, 1);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_affect_ledger() {
        let h = harness(RecordingSink {
            fail: true,
            ..Default::default()
        });
        h.source.push(EventFixture::new(0x01, H256::repeat_byte(0x99)).raw());

        let report = h.relayer.tick().await.unwrap();
        assert_eq!(report.inserted, 1);
        wait_for_notifications(&h.sink, 1).await;
        assert_eq!(h.ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_status_tracks_chain_availability() {
        let h = harness(RecordingSink::default());
        h.relayer.tick().await.unwrap();
        let status = h.relayer.status().await;
        assert!(status.chain_available);
        assert_eq!(status.watermark, 50);
        assert_eq!(status.last_poll_at, Some(h.clock.now()));

        h.source.down.store(true, Ordering::SeqCst);
        let err = h.relayer.tick().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!h.relayer.status().await.chain_available);
    }

    #[tokio::test]
    async fn test_mark_processed_requires_source_withdrawn() {
        let h = harness(RecordingSink::default());
        h.source.push(EventFixture::new(0x01, H256::repeat_byte(0x99)).raw());
        h.relayer.tick().await.unwrap();

        let id = format!("0x{}", "01".repeat(32));
        let err = h.relayer.mark_processed(&id).unwrap_err();
        assert!(matches!(err, RelayerError::StateConflict { .. }));
        assert!(matches!(
            h.relayer.mark_processed("0xmissing"),
            Err(RelayerError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_triggers_single_reconnect_after_backoff() {
        let h = harness(RecordingSink::default());
        h.source.down.store(true, Ordering::SeqCst);

        let relayer = h.relayer.clone();
        let task = tokio::spawn(async move { relayer.run().await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.source.height_calls.load(Ordering::SeqCst), 1);

        // Nothing hammers the provider during the backoff
        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert_eq!(h.source.height_calls.load(Ordering::SeqCst), 1);

        h.source.down.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(h.source.height_calls.load(Ordering::SeqCst) >= 2);
        assert!(h.relayer.status().await.chain_available);

        h.relayer.stop().await;
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_sweep_uses_injected_clock() {
        let h = harness(RecordingSink::default());
        h.source.push(EventFixture::new(0x01, H256::repeat_byte(0x99)).raw());
        h.relayer.tick().await.unwrap();

        let id = format!("0x{}", "01".repeat(32));
        h.ledger
            .transition(&id, LifecycleState::Detected, LifecycleState::Abandoned, SwapUpdate::new())
            .unwrap();
        h.clock.advance(chrono::Duration::days(30));
        assert_eq!(h.relayer.sweep().total(), 0);
        assert_eq!(h.relayer.stuck().len(), 1);
    }
}
