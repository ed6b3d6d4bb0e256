//! Swap records and their lifecycle

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;

/// Order hash of the source escrow, 0x-prefixed lowercase hex
pub type SwapId = String;

/// Lifecycle of a swap. Variants are declared in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Detected,
    DestinationFunding,
    DestinationFunded,
    Claimed,
    SourceWithdrawn,
    Processed,
    Abandoned,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Detected,
        LifecycleState::DestinationFunding,
        LifecycleState::DestinationFunded,
        LifecycleState::Claimed,
        LifecycleState::SourceWithdrawn,
        LifecycleState::Processed,
        LifecycleState::Abandoned,
    ];

    /// Position along the happy path; `Abandoned` sorts after everything.
    pub fn rank(self) -> u8 {
        match self {
            LifecycleState::Detected => 0,
            LifecycleState::DestinationFunding => 1,
            LifecycleState::DestinationFunded => 2,
            LifecycleState::Claimed => 3,
            LifecycleState::SourceWithdrawn => 4,
            LifecycleState::Processed => 5,
            LifecycleState::Abandoned => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Processed | LifecycleState::Abandoned)
    }

    /// Whether the resolver still has work to do on a record in this state
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            LifecycleState::Detected | LifecycleState::DestinationFunding
        )
    }

    /// Edge table of the lifecycle.
    ///
    /// `DestinationFunding -> Detected` is the only backwards edge: it releases
    /// the optimistic lock after a destination submission failed. A same-state
    /// transition annotates a live record without moving it.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Abandoned || next == self {
            return true;
        }
        matches!(
            (self, next),
            (Detected, DestinationFunding)
                | (DestinationFunding, DestinationFunded)
                | (DestinationFunding, Detected)
                | (DestinationFunded, Claimed)
                | (Claimed, SourceWithdrawn)
                | (SourceWithdrawn, Processed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Detected => "detected",
            LifecycleState::DestinationFunding => "destination_funding",
            LifecycleState::DestinationFunded => "destination_funded",
            LifecycleState::Claimed => "claimed",
            LifecycleState::SourceWithdrawn => "source_withdrawn",
            LifecycleState::Processed => "processed",
            LifecycleState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash function the escrow contracts commit the secret with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Keccak256,
}

impl HashAlgorithm {
    pub fn digest(self, preimage: &[u8]) -> H256 {
        match self {
            HashAlgorithm::Sha256 => H256::from_slice(&Sha256::digest(preimage)),
            HashAlgorithm::Keccak256 => H256::from_slice(&Keccak256::digest(preimage)),
        }
    }

    pub fn verify(self, preimage: &H256, hashlock: &H256) -> bool {
        self.digest(preimage.as_bytes()) == *hashlock
    }
}

/// Source-chain escrow parties, copied verbatim from the event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceParties {
    pub maker: String,
    pub taker: String,
    pub token: String,
    pub amount: U256,
    pub safety_deposit: U256,
    pub timelocks: U256,
}

/// Destination-chain terms, copied verbatim from the event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationParties {
    pub chain_id: u64,
    pub maker: String,
    pub token: String,
    pub amount: U256,
    pub safety_deposit: U256,
}

/// Coordination state of one swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: SwapId,
    pub hashlock: H256,
    pub preimage: Option<H256>,
    pub source: SourceParties,
    pub destination: DestinationParties,
    pub state: LifecycleState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub abandon_reason: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub source_block: u64,
    pub source_tx_ref: String,
    pub dest_recipient: Option<String>,
    pub dest_tx_ref: Option<String>,
    pub claim_tx_ref: Option<String>,
    pub withdraw_tx_ref: Option<String>,
}

impl SwapRecord {
    /// Public view without the secret
    pub fn snapshot(&self) -> SwapSnapshot {
        SwapSnapshot {
            id: self.id.clone(),
            hashlock: self.hashlock,
            state: self.state,
            source: self.source.clone(),
            destination: self.destination.clone(),
            source_block: self.source_block,
            source_tx_ref: self.source_tx_ref.clone(),
            detected_at: self.detected_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapSnapshot {
    pub id: SwapId,
    pub hashlock: H256,
    pub state: LifecycleState,
    pub source: SourceParties,
    pub destination: DestinationParties,
    pub source_block: u64,
    pub source_tx_ref: String,
    pub detected_at: DateTime<Utc>,
}

/// Field changes applied together with a state change.
///
/// Only fields that are allowed to change after creation appear here; the
/// set-once fields are rejected by the ledger when already populated.
#[derive(Debug, Clone, Default)]
pub struct SwapUpdate {
    pub(crate) preimage: Option<H256>,
    pub(crate) dest_recipient: Option<String>,
    pub(crate) dest_tx_ref: Option<String>,
    pub(crate) claim_tx_ref: Option<String>,
    pub(crate) withdraw_tx_ref: Option<String>,
    pub(crate) attempts: AttemptChange,
    pub(crate) last_error: Option<Option<String>>,
    pub(crate) abandon_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum AttemptChange {
    #[default]
    Keep,
    Increment,
    Reset,
}

impl SwapUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preimage(mut self, preimage: H256) -> Self {
        self.preimage = Some(preimage);
        self
    }

    pub fn dest_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.dest_recipient = Some(recipient.into());
        self
    }

    pub fn dest_tx_ref(mut self, tx: impl Into<String>) -> Self {
        self.dest_tx_ref = Some(tx.into());
        self
    }

    pub fn claim_tx_ref(mut self, tx: impl Into<String>) -> Self {
        self.claim_tx_ref = Some(tx.into());
        self
    }

    pub fn withdraw_tx_ref(mut self, tx: impl Into<String>) -> Self {
        self.withdraw_tx_ref = Some(tx.into());
        self
    }

    pub fn bump_attempts(mut self) -> Self {
        self.attempts = AttemptChange::Increment;
        self
    }

    pub fn reset_attempts(mut self) -> Self {
        self.attempts = AttemptChange::Reset;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn abandon_reason(mut self, reason: impl Into<String>) -> Self {
        self.abandon_reason = Some(reason.into());
        self
    }
}
