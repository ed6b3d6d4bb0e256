//! Resolver task: destination funding, secret handling, source withdrawal
//!
//! Every step starts with a compare-and-swap on the ledger, so two resolver
//! ticks (or a tick and an operator call) never submit the same step twice.

use super::recipient::{Passthrough, RecipientMapper};
use super::relayer::EscrowRelayer;
use crate::chain::{with_timeout, DestinationChain, DestinationLock, Release, SourceChain};
use crate::clock::Clock;
use crate::config::ResolverConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{LifecycleState, SwapId, SwapLedger, SwapRecord, SwapUpdate};

use chrono::{DateTime, Utc};
use ethers::types::H256;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use LifecycleState::*;

/// Outcome counts of one resolver tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub funded: usize,
    pub withdrawn: usize,
    pub settled: usize,
    pub abandoned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Fund,
    Withdraw,
    Settle,
}

/// Drives swaps from `Detected` to `Processed`
pub struct EscrowResolver {
    ledger: Arc<SwapLedger>,
    relayer: Arc<EscrowRelayer>,
    destination: Arc<dyn DestinationChain>,
    source: Arc<dyn SourceChain>,
    recipients: Arc<dyn RecipientMapper>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
    expiry_height: u64,
    shutdown: Arc<RwLock<bool>>,
}

impl EscrowResolver {
    pub fn new(
        relayer: Arc<EscrowRelayer>,
        destination: Arc<dyn DestinationChain>,
        source: Arc<dyn SourceChain>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
        expiry_height: u64,
    ) -> Self {
        Self {
            ledger: relayer.ledger().clone(),
            relayer,
            destination,
            source,
            recipients: Arc::new(Passthrough),
            clock,
            config,
            expiry_height,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_recipients(mut self, recipients: Arc<dyn RecipientMapper>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Mirror the source lock on the destination chain.
    ///
    /// Only the caller that wins `Detected -> DestinationFunding` submits. A
    /// retryable failure rolls the record back to `Detected` for the next
    /// tick; anything else, or the retry ceiling, abandons it.
    pub async fn fund_destination(&self, id: &str) -> RelayerResult<SwapRecord> {
        let record = self
            .ledger
            .transition(id, Detected, DestinationFunding, SwapUpdate::new())?;

        let recipient = match self.recipients.recipient(&record) {
            Ok(recipient) => recipient,
            Err(e) => return Err(self.funding_failed(&record, e)),
        };

        let lock = DestinationLock {
            id: record.id.clone(),
            hashlock: record.hashlock,
            recipient: recipient.clone(),
            amount: record.destination.amount,
            expiry_height: self.expiry_height,
        };

        match with_timeout(
            "destination_lock",
            self.config.request_timeout(),
            self.destination.lock(&lock),
        )
        .await
        {
            Ok(tx) => {
                crate::metrics::record_resolver_action("fund", true);
                let funded = self.ledger.transition(
                    id,
                    DestinationFunding,
                    DestinationFunded,
                    SwapUpdate::new()
                        .dest_recipient(recipient)
                        .dest_tx_ref(tx)
                        .reset_attempts()
                        .clear_error(),
                )?;
                info!(swap_id = %id, "Destination funded");
                Ok(funded)
            }
            Err(e) => Err(self.funding_failed(&record, e)),
        }
    }

    fn funding_failed(&self, record: &SwapRecord, err: RelayerError) -> RelayerError {
        crate::metrics::record_resolver_action("fund", false);
        let attempts = record.attempts.saturating_add(1);
        let update = SwapUpdate::new().bump_attempts().error(err.to_string());

        let outcome = if err.is_retryable() && attempts < self.config.max_attempts {
            warn!(
                swap_id = %record.id,
                "Destination funding attempt {}/{} failed: {}",
                attempts, self.config.max_attempts, err
            );
            self.ledger
                .transition(&record.id, DestinationFunding, Detected, update)
        } else {
            error!(
                swap_id = %record.id,
                "Abandoning swap after funding attempt {}: {}", attempts, err
            );
            self.ledger.transition(
                &record.id,
                DestinationFunding,
                Abandoned,
                update.abandon_reason(format!("destination funding failed: {}", err)),
            )
        };

        if let Err(e) = outcome {
            error!(swap_id = %record.id, "Failed to record funding failure: {}", e);
        }
        err
    }

    /// Claim the destination escrow with `preimage` and record the secret
    pub async fn reveal_secret(&self, id: &str, preimage: H256) -> RelayerResult<SwapRecord> {
        let record = self.expect_state(id, DestinationFunded)?;
        self.check_preimage(&record, &preimage, "reveal_secret")?;

        let release = Release {
            id: record.id.clone(),
            preimage,
            recipient: record.dest_recipient.clone(),
        };
        let tx = match with_timeout(
            "destination_claim",
            self.config.request_timeout(),
            self.destination.claim(&release),
        )
        .await
        {
            Ok(tx) => tx,
            Err(e) => {
                crate::metrics::record_resolver_action("claim", false);
                warn!(swap_id = %id, "Destination claim failed: {}", e);
                self.annotate(id, DestinationFunded, &e);
                return Err(e);
            }
        };

        crate::metrics::record_resolver_action("claim", true);
        self.claimed(id, preimage, Some(tx))
    }

    /// Record a claim that was made on the destination by someone else
    pub fn accept_claim(
        &self,
        id: &str,
        preimage: H256,
        claim_tx_ref: Option<String>,
    ) -> RelayerResult<SwapRecord> {
        let record = self.expect_state(id, DestinationFunded)?;
        self.check_preimage(&record, &preimage, "accept_claim")?;
        self.claimed(id, preimage, claim_tx_ref)
    }

    fn claimed(
        &self,
        id: &str,
        preimage: H256,
        claim_tx_ref: Option<String>,
    ) -> RelayerResult<SwapRecord> {
        let mut update = SwapUpdate::new()
            .preimage(preimage)
            .reset_attempts()
            .clear_error();
        if let Some(tx) = claim_tx_ref {
            update = update.claim_tx_ref(tx);
        }
        let record = self.ledger.transition(id, DestinationFunded, Claimed, update)?;
        info!(swap_id = %id, "Secret revealed, swap claimed");
        Ok(record)
    }

    /// Reject a preimage that does not open the hashlock, leaving an error
    /// on the record so it surfaces in the stuck listing
    fn check_preimage(
        &self,
        record: &SwapRecord,
        preimage: &H256,
        operation: &str,
    ) -> RelayerResult<()> {
        if self.ledger.hash_algorithm().verify(preimage, &record.hashlock) {
            return Ok(());
        }

        let err = RelayerError::Integrity {
            id: record.id.clone(),
            message: format!("preimage does not hash to hashlock {:?}", record.hashlock),
        };
        error!(swap_id = %record.id, "{} rejected: {}", operation, err);
        crate::metrics::record_integrity_failure(operation);
        self.annotate(&record.id, record.state, &err);
        Err(err)
    }

    /// Withdraw the source escrow with the revealed secret
    pub async fn withdraw_source(&self, id: &str) -> RelayerResult<SwapRecord> {
        let record = self.expect_state(id, Claimed)?;
        let preimage = record.preimage.ok_or_else(|| RelayerError::Integrity {
            id: id.to_string(),
            message: "claimed swap without preimage".to_string(),
        })?;

        let release = Release {
            id: record.id.clone(),
            preimage,
            recipient: None,
        };
        match with_timeout(
            "source_withdraw",
            self.config.request_timeout(),
            self.source.withdraw(&release),
        )
        .await
        {
            Ok(tx) => {
                crate::metrics::record_resolver_action("withdraw", true);
                let withdrawn = self.ledger.transition(
                    id,
                    Claimed,
                    SourceWithdrawn,
                    SwapUpdate::new()
                        .withdraw_tx_ref(tx)
                        .reset_attempts()
                        .clear_error(),
                )?;
                info!(swap_id = %id, "Source escrow withdrawn");
                Ok(withdrawn)
            }
            Err(e) => {
                crate::metrics::record_resolver_action("withdraw", false);
                let attempts = record.attempts.saturating_add(1);
                let update = SwapUpdate::new().bump_attempts().error(e.to_string());
                let outcome = if e.is_retryable() && attempts < self.config.max_attempts {
                    warn!(
                        swap_id = %id,
                        "Source withdrawal attempt {}/{} failed: {}",
                        attempts, self.config.max_attempts, e
                    );
                    self.ledger.transition(id, Claimed, Claimed, update)
                } else {
                    error!(swap_id = %id, "Abandoning swap after withdrawal attempt {}: {}", attempts, e);
                    self.ledger.transition(
                        id,
                        Claimed,
                        Abandoned,
                        update.abandon_reason(format!("source withdrawal failed: {}", e)),
                    )
                };
                if let Err(record_err) = outcome {
                    error!(swap_id = %id, "Failed to record withdrawal failure: {}", record_err);
                }
                Err(e)
            }
        }
    }

    fn expect_state(&self, id: &str, expected: LifecycleState) -> RelayerResult<SwapRecord> {
        let record = self.ledger.get(id)?;
        if record.state != expected {
            return Err(RelayerError::StateConflict {
                id: id.to_string(),
                expected,
                actual: record.state,
            });
        }
        Ok(record)
    }

    /// Same-state annotation; loses silently to a concurrent transition
    fn annotate(&self, id: &str, state: LifecycleState, err: &RelayerError) {
        let update = SwapUpdate::new().error(err.to_string());
        if let Err(e) = self.ledger.transition(id, state, state, update) {
            debug!(swap_id = %id, "Could not annotate swap: {}", e);
        }
    }

    /// Abandon records whose step outlived its deadline
    fn expire_deadlines(&self, now: DateTime<Utc>) -> usize {
        let deadlines = [
            (DestinationFunding, self.config.funding_timeout(), "funding deadline elapsed"),
            (DestinationFunded, self.config.claim_timeout(), "claim deadline elapsed"),
        ];

        let mut abandoned = 0;
        for (state, timeout, reason) in deadlines {
            for record in self.ledger.in_state(state) {
                if now - record.state_entered_at <= timeout {
                    continue;
                }
                match self.ledger.transition(
                    &record.id,
                    state,
                    Abandoned,
                    SwapUpdate::new().abandon_reason(reason),
                ) {
                    Ok(_) => {
                        warn!(swap_id = %record.id, "Abandoned in {}: {}", state, reason);
                        abandoned += 1;
                    }
                    Err(e) => debug!(swap_id = %record.id, "Deadline lost race: {}", e),
                }
            }
        }
        abandoned
    }

    /// One pass over the ledger.
    ///
    /// Swaps are worked concurrently up to `max_concurrent_swaps`; a slow
    /// chain call on one swap never holds up another.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            abandoned: self.expire_deadlines(self.clock.now()),
            ..Default::default()
        };

        let mut work: Vec<(SwapId, Step)> = self
            .ledger
            .in_state(Detected)
            .into_iter()
            .map(|r| (r.id, Step::Fund))
            .collect();
        work.extend(
            self.ledger
                .in_state(Claimed)
                .into_iter()
                .map(|r| (r.id, Step::Withdraw)),
        );
        if self.config.auto_settle {
            work.extend(
                self.ledger
                    .in_state(SourceWithdrawn)
                    .into_iter()
                    .map(|r| (r.id, Step::Settle)),
            );
        }

        let outcomes: Vec<(Step, RelayerResult<SwapRecord>)> = stream::iter(work)
            .map(|(id, step)| async move { (step, self.run_step(&id, step).await) })
            .buffer_unordered(self.config.max_concurrent_swaps.max(1))
            .collect()
            .await;

        for (step, outcome) in outcomes {
            match outcome {
                Ok(record) => match step {
                    Step::Fund => report.funded += 1,
                    Step::Withdraw => {
                        report.withdrawn += 1;
                        if record.state == Processed {
                            report.settled += 1;
                        }
                    }
                    Step::Settle => report.settled += 1,
                },
                Err(RelayerError::StateConflict { .. }) => {}
                Err(_) => report.failed += 1,
            }
        }
        if report != TickReport::default() {
            debug!("Resolver tick {:?}", report);
        }
        report
    }

    async fn run_step(&self, id: &str, step: Step) -> RelayerResult<SwapRecord> {
        match step {
            Step::Fund => self.fund_destination(id).await,
            Step::Withdraw => {
                let withdrawn = self.withdraw_source(id).await?;
                if self.config.auto_settle {
                    self.relayer.mark_processed(id)
                } else {
                    Ok(withdrawn)
                }
            }
            Step::Settle => self.relayer.mark_processed(id),
        }
    }

    /// Main resolver loop
    pub async fn run(&self) -> RelayerResult<()> {
        let mut tick_interval = interval(self.config.tick_interval());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Escrow resolver started (destination chain {}, source chain {})",
            self.destination.chain_id(),
            self.source.chain_id()
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tick_interval.tick().await;
            self.tick().await;
        }

        info!("Escrow resolver stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Escrow resolver shutdown initiated");
    }
}
