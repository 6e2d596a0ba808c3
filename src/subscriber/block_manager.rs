use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use alloy::{primitives::Address, rpc::types::Log};
use async_trait::async_trait;
use futures::future::join_all;

use super::BlockSubscriber;
use crate::types::{BlockHeader, LogEvent};

/// Source of per block log batches.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Delivers, for every block after `after_block`, the logs emitted by `addresses`.
    async fn subscribe(
        &self,
        addresses: Vec<Address>,
        after_block: u64,
        subscriber: Arc<dyn BlockSubscriber>,
    );
}

#[derive(Clone)]
struct Subscription {
    addresses: HashSet<Address>,
    after_block: u64,
    subscriber: Arc<dyn BlockSubscriber>,
}

/// In-process [`LogSource`], fed one block at a time by the host.
#[derive(Default)]
pub struct BlockManager {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockManager")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every subscription registered under `name`.
    pub fn unsubscribe(&self, name: &str) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscription| subscription.subscriber.name() != name);
    }

    /// Hands each subscriber the logs of its addresses, sorted by ordering key.
    ///
    /// Subscribers whose addresses emitted nothing still receive an empty batch so that their
    /// block number advances. Returns the number of subscribers that failed.
    pub async fn handle_block(&self, mut logs: Vec<LogEvent>, header: &BlockHeader) -> usize {
        logs.sort();

        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|subscription| subscription.after_block < header.number)
            .cloned()
            .collect::<Vec<_>>();

        let logs = &logs;
        let updates = subscriptions.into_iter().map(|subscription| async move {
            let batch = logs
                .iter()
                .filter(|log| subscription.addresses.contains(&log.address))
                .cloned()
                .collect::<Vec<_>>();

            let result = subscription.subscriber.on_block(&batch, header).await;
            (subscription.subscriber, result)
        });

        let mut failures = 0;
        for (subscriber, result) in join_all(updates).await {
            if let Err(err) = result {
                failures += 1;
                tracing::error!(
                    target = "amms_sync::subscriber",
                    name = subscriber.name(),
                    block_number = header.number,
                    ?err,
                    "Subscriber failed to process block"
                );
            }
        }

        failures
    }

    /// Same as [`BlockManager::handle_block`] for logs as returned by an RPC node. Pending logs
    /// without a position in the chain are skipped.
    pub async fn handle_rpc_logs(&self, logs: Vec<Log>, header: &BlockHeader) -> usize {
        let logs = logs
            .into_iter()
            .filter_map(|log| {
                LogEvent::try_from(log)
                    .inspect_err(|err| {
                        tracing::warn!(target = "amms_sync::subscriber", ?err, "Skipping log");
                    })
                    .ok()
            })
            .collect();

        self.handle_block(logs, header).await
    }
}

#[async_trait]
impl LogSource for BlockManager {
    async fn subscribe(
        &self,
        addresses: Vec<Address>,
        after_block: u64,
        subscriber: Arc<dyn BlockSubscriber>,
    ) {
        tracing::debug!(
            target = "amms_sync::subscriber",
            name = subscriber.name(),
            addresses = addresses.len(),
            after_block,
            "Subscribed"
        );

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                addresses: addresses.into_iter().collect(),
                after_block,
                subscriber,
            });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use alloy::primitives::Address;
    use async_trait::async_trait;

    use super::*;
    use crate::subscriber::{
        error::SubscriberError,
        testing::{header, log},
    };

    #[derive(Default)]
    struct Recorder {
        name: String,
        blocks: Mutex<Vec<(u64, Vec<(u64, u64)>)>>,
        fail: bool,
    }

    #[async_trait]
    impl BlockSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_block(
            &self,
            logs: &[LogEvent],
            header: &BlockHeader,
        ) -> Result<(), SubscriberError> {
            self.blocks.lock().unwrap().push((
                header.number,
                logs.iter()
                    .map(|log| (log.transaction_index, log.log_index))
                    .collect(),
            ));
            if self.fail {
                return Err(SubscriberError::UnexpectedOutputCount {
                    expected: 0,
                    actual: 1,
                });
            }
            Ok(())
        }
    }

    fn recorder(name: &str, fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            fail,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_routes_sorted_logs_per_address() {
        let manager = BlockManager::new();
        let a = recorder("a", false);
        let b = recorder("b", false);
        let idle = recorder("idle", false);

        manager
            .subscribe(vec![Address::with_last_byte(1)], 10, a.clone())
            .await;
        manager
            .subscribe(
                vec![Address::with_last_byte(1), Address::with_last_byte(2)],
                10,
                b.clone(),
            )
            .await;
        manager
            .subscribe(vec![Address::with_last_byte(3)], 10, idle.clone())
            .await;

        let logs = vec![
            log(Address::with_last_byte(2), 11, 4, vec![]),
            log(Address::with_last_byte(1), 11, 2, vec![]),
            log(Address::with_last_byte(1), 11, 0, vec![]),
        ];
        assert_eq!(manager.handle_block(logs, &header(11, 0)).await, 0);

        assert_eq!(*a.blocks.lock().unwrap(), vec![(11, vec![(0, 0), (0, 2)])]);
        assert_eq!(
            *b.blocks.lock().unwrap(),
            vec![(11, vec![(0, 0), (0, 2), (0, 4)])]
        );
        assert_eq!(*idle.blocks.lock().unwrap(), vec![(11, vec![])]);
    }

    #[tokio::test]
    async fn test_blocks_before_subscription_are_not_delivered() {
        let manager = BlockManager::new();
        let late = recorder("late", false);
        manager
            .subscribe(vec![Address::with_last_byte(1)], 20, late.clone())
            .await;

        manager.handle_block(vec![], &header(20, 0)).await;
        manager.handle_block(vec![], &header(21, 0)).await;

        assert_eq!(*late.blocks.lock().unwrap(), vec![(21, vec![])]);
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_isolated() {
        let manager = BlockManager::new();
        let ok = recorder("ok", false);
        manager.subscribe(vec![], 0, recorder("broken", true)).await;
        manager.subscribe(vec![], 0, ok.clone()).await;

        assert_eq!(manager.handle_block(vec![], &header(1, 0)).await, 1);
        assert_eq!(ok.blocks.lock().unwrap().len(), 1);

        manager.unsubscribe("broken");
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.handle_block(vec![], &header(2, 0)).await, 0);
    }
}
