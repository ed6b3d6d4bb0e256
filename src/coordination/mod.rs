//! Coordination tasks for the cross-chain swap
//!
//! The relayer:
//! 1. Polls the source chain through the watcher
//! 2. Decodes escrow creations into ledger records, once per order
//! 3. Notifies about new escrows and sweeps the ledger
//!
//! The resolver funds the destination, takes in the revealed secret,
//! withdraws on the source and applies deadlines and the retry ceiling.

pub mod recipient;
pub mod relayer;
pub mod resolver;

pub use recipient::{Passthrough, RecipientMapper, StaticRecipients};
pub use relayer::{EscrowRelayer, IngestReport, RelayerStatus};
pub use resolver::{EscrowResolver, TickReport};
