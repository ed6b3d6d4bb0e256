//! Source maker to destination recipient mapping

use crate::error::{RelayerError, RelayerResult};
use crate::state::SwapRecord;

use std::collections::HashMap;

/// Resolves who receives the mirrored lock on the destination chain
pub trait RecipientMapper: Send + Sync {
    fn recipient(&self, record: &SwapRecord) -> RelayerResult<String>;
}

/// Uses the destination maker from the event verbatim
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl RecipientMapper for Passthrough {
    fn recipient(&self, record: &SwapRecord) -> RelayerResult<String> {
        Ok(record.destination.maker.clone())
    }
}

/// Fixed table keyed by source maker, matched case-insensitively
#[derive(Debug, Clone, Default)]
pub struct StaticRecipients {
    table: HashMap<String, String>,
}

impl StaticRecipients {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self {
            table: table
                .into_iter()
                .map(|(maker, recipient)| (maker.to_lowercase(), recipient))
                .collect(),
        }
    }
}

impl RecipientMapper for StaticRecipients {
    fn recipient(&self, record: &SwapRecord) -> RelayerResult<String> {
        self.table
            .get(&record.source.maker.to_lowercase())
            .cloned()
            .ok_or_else(|| RelayerError::Submission {
                chain_id: record.destination.chain_id,
                message: format!("no destination recipient for maker {}", record.source.maker),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use ethers::types::H256;

    #[test]
    fn test_static_table_is_case_insensitive() {
        let record = crate::state::test_record("0x01", H256::zero(), ManualClock::default().now());
        let mapper = StaticRecipients::new(HashMap::from([(
            record.source.maker.to_uppercase().replace("0X", "0x"),
            "inj1maker".to_string(),
        )]));
        assert_eq!(mapper.recipient(&record).unwrap(), "inj1maker");
    }

    #[test]
    fn test_unmapped_maker_is_not_retryable() {
        let record = crate::state::test_record("0x01", H256::zero(), ManualClock::default().now());
        let err = StaticRecipients::default().recipient(&record).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(Passthrough.recipient(&record).unwrap(), record.destination.maker);
    }
}
