//! Escrow Relayer - cross-chain HTLC escrow swap coordination
//!
//! Watches an EVM escrow factory for `SrcEscrowCreated`, mirrors each lock
//! on a CosmWasm destination chain, and settles the source escrow once the
//! secret is revealed.

pub mod api;
pub mod chain;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod notify;
pub mod state;
