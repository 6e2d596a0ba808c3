use std::cmp::Ordering;

use alloy::{
    primitives::{Address, Bytes, B256},
    rpc::types::Log,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogConversionError {
    #[error("Log is missing its block number")]
    MissingBlockNumber,
    #[error("Log is missing its transaction index")]
    MissingTransactionIndex,
    #[error("Log is missing its log index")]
    MissingLogIndex,
}

/// A contract event log positioned within the chain.
///
/// Logs are ordered by `(block_number, transaction_index, log_index)`, which is
/// also the order in which they must be applied to a pool state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl LogEvent {
    pub const fn ordering_key(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }

    /// First topic of the log, i.e. the event signature hash for non-anonymous events.
    pub fn signature(&self) -> Option<&B256> {
        self.topics.first()
    }
}

impl PartialOrd for LogEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key()
            .cmp(&other.ordering_key())
            .then_with(|| self.address.cmp(&other.address))
    }
}

impl TryFrom<Log> for LogEvent {
    type Error = LogConversionError;

    fn try_from(log: Log) -> Result<Self, Self::Error> {
        Ok(Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_number: log
                .block_number
                .ok_or(LogConversionError::MissingBlockNumber)?,
            transaction_index: log
                .transaction_index
                .ok_or(LogConversionError::MissingTransactionIndex)?,
            log_index: log.log_index.ok_or(LogConversionError::MissingLogIndex)?,
        })
    }
}

/// Returns true if the logs are in strictly increasing ordering key order.
pub fn is_strictly_ordered(logs: &[LogEvent]) -> bool {
    logs.windows(2)
        .all(|pair| pair[0].ordering_key() < pair[1].ordering_key())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
    pub parent_hash: B256,
    pub hash: B256,
}

impl BlockHeader {
    pub const fn new(number: u64, timestamp: u64, parent_hash: B256, hash: B256) -> Self {
        Self {
            number,
            timestamp,
            parent_hash,
            hash,
        }
    }

    /// Whether `self` directly extends a block with the given number and hash.
    pub fn extends(&self, number: u64, hash: B256) -> bool {
        self.number == number + 1 && self.parent_hash == hash
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{address, b256, Bytes, LogData};

    use super::*;

    fn log_at(block_number: u64, transaction_index: u64, log_index: u64) -> LogEvent {
        LogEvent {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_number,
            transaction_index,
            log_index,
        }
    }

    #[test]
    fn test_log_ordering() {
        let mut logs = vec![log_at(2, 0, 0), log_at(1, 3, 7), log_at(1, 3, 2), log_at(1, 0, 9)];
        assert!(!is_strictly_ordered(&logs));

        logs.sort();
        let keys = logs.iter().map(LogEvent::ordering_key).collect::<Vec<_>>();
        assert_eq!(keys, vec![(1, 0, 9), (1, 3, 2), (1, 3, 7), (2, 0, 0)]);
        assert!(is_strictly_ordered(&logs));
    }

    #[test]
    fn test_duplicate_key_is_not_strictly_ordered() {
        let logs = vec![log_at(1, 0, 0), log_at(1, 0, 0)];
        assert!(!is_strictly_ordered(&logs));
    }

    #[test]
    fn test_log_conversion() {
        let topic = b256!("1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1");
        let log = Log {
            inner: alloy::primitives::Log {
                address: address!("B4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc"),
                data: LogData::new_unchecked(vec![topic], Bytes::from(vec![1, 2, 3])),
            },
            block_number: Some(17),
            transaction_index: Some(4),
            log_index: Some(9),
            ..Default::default()
        };

        let event = LogEvent::try_from(log.clone()).unwrap();
        assert_eq!(event.ordering_key(), (17, 4, 9));
        assert_eq!(event.signature(), Some(&topic));
        assert_eq!(event.data, Bytes::from(vec![1, 2, 3]));

        let pending = Log {
            block_number: None,
            ..log
        };
        assert_eq!(
            LogEvent::try_from(pending),
            Err(LogConversionError::MissingBlockNumber)
        );
    }

    #[test]
    fn test_header_extends() {
        let parent = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let header = BlockHeader::new(11, 0, parent, B256::ZERO);
        assert!(header.extends(10, parent));
        assert!(!header.extends(10, B256::ZERO));
        assert!(!header.extends(9, parent));
    }
}
