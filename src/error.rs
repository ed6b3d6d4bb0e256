//! Error types for the escrow relayer

use crate::state::LifecycleState;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain_id} unavailable: {message}")]
    ChainUnavailable { chain_id: u64, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Event decoding error: {0}")]
    Decode(String),

    #[error("Duplicate event for swap {id}")]
    DuplicateEvent { id: String },

    #[error("State conflict on swap {id}: expected {expected}, found {actual}")]
    StateConflict {
        id: String,
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Integrity error on swap {id}: {message}")]
    Integrity { id: String, message: String },

    #[error("Active swap {id} evicted in state {state} under capacity pressure")]
    CapacityEvictionOfActiveRecord { id: String, state: LifecycleState },

    #[error("Swap {id} not found")]
    NotFound { id: String },

    #[error("Submission rejected on chain {chain_id}: {message}")]
    Submission { chain_id: u64, message: String },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainUnavailable { .. } | RelayerError::Timeout { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Integrity { .. } | RelayerError::CapacityEvictionOfActiveRecord { .. }
        )
    }

    /// Short label used for metrics and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::Config(_) => "config",
            RelayerError::ChainUnavailable { .. } => "chain_unavailable",
            RelayerError::Timeout { .. } => "timeout",
            RelayerError::Decode(_) => "decode",
            RelayerError::DuplicateEvent { .. } => "duplicate_event",
            RelayerError::StateConflict { .. } => "state_conflict",
            RelayerError::InvalidStateTransition { .. } => "invalid_transition",
            RelayerError::Integrity { .. } => "integrity",
            RelayerError::CapacityEvictionOfActiveRecord { .. } => "capacity_eviction",
            RelayerError::NotFound { .. } => "not_found",
            RelayerError::Submission { .. } => "submission",
            RelayerError::Notification(_) => "notification",
            RelayerError::Internal(_) => "internal",
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
