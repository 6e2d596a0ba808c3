pub mod block_manager;
pub mod composed;
pub mod error;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use error::SubscriberError;
use tokio::sync::Mutex;

use crate::{
    state::{PoolState, Snapshot, StateStore},
    types::{is_strictly_ordered, BlockHeader, LogEvent},
};

pub use block_manager::{BlockManager, LogSource};
pub use composed::{ComposedSubscriber, PartialSubscriber};

/// Protocol specific behaviour plugged into an [`EventSubscriber`].
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type State: PoolState;

    fn name(&self) -> &str;

    fn addresses_subscribed(&self) -> Vec<Address>;

    /// Applies a single log to `state`, returning the next state.
    ///
    /// Logs that are irrelevant to the handler return the state unchanged. `None` means the log
    /// could not be used and the state must be rebuilt from chain reads.
    fn process_log(
        &self,
        state: &Self::State,
        log: &LogEvent,
        header: &BlockHeader,
    ) -> Option<Self::State>;

    /// Builds the state from scratch as of `block_number`.
    async fn generate_state(&self, block_number: u64) -> Result<Self::State, SubscriberError>;
}

/// A protocol event set decoded from raw logs.
pub trait EventDecoder: Sized {
    /// `Ok(None)` for logs that do not belong to the set.
    fn decode_log(log: &LogEvent) -> Result<Option<Self>, alloy::sol_types::Error>;
}

/// Decodes `log` into `E` and applies it.
///
/// Unknown events leave the state unchanged and decode errors return `None`.
pub fn process_decoded<S, E>(
    name: &str,
    state: &S,
    log: &LogEvent,
    apply: impl FnOnce(&S, E) -> Option<S>,
) -> Option<S>
where
    S: Clone,
    E: EventDecoder,
{
    match E::decode_log(log) {
        Ok(Some(event)) => apply(state, event),
        Ok(None) => Some(state.clone()),
        Err(err) => {
            tracing::error!(
                target = "amms_sync::subscriber",
                name,
                address = ?log.address,
                block_number = log.block_number,
                log_index = log.log_index,
                ?err,
                "Failed to decode log"
            );
            None
        }
    }
}

/// Type erased block consumer, used by [`LogSource`] implementations.
#[async_trait]
pub trait BlockSubscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn on_block(&self, logs: &[LogEvent], header: &BlockHeader)
        -> Result<(), SubscriberError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Uninitialized,
    Synced,
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct LastBlock {
    number: u64,
    /// Unknown when the state was generated from a bare block number.
    hash: Option<B256>,
}

/// Keeps a pool state in sync with the chain.
///
/// Logs are applied incrementally while blocks arrive in sequence. Anything else (a reorg, a gap,
/// a log that cannot be applied or an invalid resulting state) rebuilds the state from chain
/// reads at the block being processed.
pub struct EventSubscriber<H: EventHandler> {
    handler: H,
    store: StateStore<H::State>,
    status: RwLock<SyncStatus>,
    invalid: AtomicBool,
    last_block: Mutex<Option<LastBlock>>,
}

impl<H: EventHandler> fmt::Debug for EventSubscriber<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("name", &self.handler.name())
            .field("status", &self.status())
            .field("block_number", &self.store.block_number())
            .finish_non_exhaustive()
    }
}

impl<H: EventHandler> EventSubscriber<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            store: StateStore::new(),
            status: RwLock::new(SyncStatus::Uninitialized),
            invalid: AtomicBool::new(false),
            last_block: Mutex::new(None),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    /// Forces a regeneration on the next block.
    pub fn set_invalid(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    /// Generates the state as of `block_number`, then starts receiving the logs of the following
    /// blocks from `source`.
    pub async fn initialize(
        self: &Arc<Self>,
        block_number: u64,
        source: &dyn LogSource,
    ) -> Result<(), SubscriberError> {
        {
            let mut last_block = self.last_block.lock().await;
            self.regenerate(block_number).await?;
            *last_block = Some(LastBlock {
                number: block_number,
                hash: None,
            });
        }

        source
            .subscribe(
                self.handler.addresses_subscribed(),
                block_number,
                self.clone() as Arc<dyn BlockSubscriber>,
            )
            .await;

        tracing::info!(
            target = "amms_sync::subscriber",
            name = self.handler.name(),
            block_number,
            "Initialized"
        );

        Ok(())
    }

    /// Returns the state if it is usable for pricing at `block_number`.
    pub fn get_state(&self, block_number: Option<u64>) -> Option<Snapshot<H::State>> {
        if self.status() != SyncStatus::Synced || self.is_invalid() {
            return None;
        }
        self.store.get_state(block_number)
    }

    /// Processes the logs emitted for this subscriber in the block described by `header`.
    pub async fn update(
        &self,
        logs: &[LogEvent],
        header: &BlockHeader,
    ) -> Result<(), SubscriberError> {
        let mut last_block = self.last_block.lock().await;

        if let Some(last) = *last_block {
            if header.number < last.number {
                tracing::debug!(
                    target = "amms_sync::subscriber",
                    name = self.handler.name(),
                    last = last.number,
                    block_number = header.number,
                    "Ignoring older block"
                );
                return Ok(());
            }

            if header.number == last.number && last.hash == Some(header.hash) {
                tracing::debug!(
                    target = "amms_sync::subscriber",
                    name = self.handler.name(),
                    block_number = header.number,
                    "Ignoring duplicate block"
                );
                return Ok(());
            }
        }

        let incremental = match (*last_block, self.status()) {
            (Some(last), SyncStatus::Synced) if !self.is_invalid() => {
                let in_sequence = header.number == last.number + 1
                    && last.hash.map_or(true, |hash| hash == header.parent_hash);
                if !in_sequence {
                    tracing::warn!(
                        target = "amms_sync::subscriber",
                        name = self.handler.name(),
                        last = last.number,
                        block_number = header.number,
                        "Block does not extend the last processed block, regenerating"
                    );
                }
                in_sequence
            }
            _ => false,
        };

        let applied = if incremental {
            self.apply_logs(logs, header)
        } else {
            None
        };

        match applied {
            Some(state) => {
                self.store.set_state(state, header.number);
            }
            None => self.regenerate(header.number).await?,
        }

        *last_block = Some(LastBlock {
            number: header.number,
            hash: Some(header.hash),
        });

        Ok(())
    }

    /// Threads the current state through `logs`. `None` if any log was unusable or produced an
    /// invalid state.
    fn apply_logs(&self, logs: &[LogEvent], header: &BlockHeader) -> Option<H::State> {
        let snapshot = self.store.get_state(None)?;

        if let Some(stray) = logs.iter().find(|log| log.block_number != header.number) {
            tracing::warn!(
                target = "amms_sync::subscriber",
                name = self.handler.name(),
                block_number = header.number,
                log_block_number = stray.block_number,
                "Log from another block, regenerating"
            );
            return None;
        }

        let sorted;
        let logs = if is_strictly_ordered(logs) {
            logs
        } else {
            tracing::warn!(
                target = "amms_sync::subscriber",
                name = self.handler.name(),
                block_number = header.number,
                "Logs delivered out of order"
            );
            let mut owned = logs.to_vec();
            owned.sort();
            // Equal ordering keys survive sorting
            if !is_strictly_ordered(&owned) {
                tracing::warn!(
                    target = "amms_sync::subscriber",
                    name = self.handler.name(),
                    block_number = header.number,
                    "Duplicate logs, regenerating"
                );
                return None;
            }
            sorted = owned;
            &sorted
        };

        let mut state = snapshot.state.as_ref().clone();
        for log in logs {
            match self.handler.process_log(&state, log, header) {
                Some(next) if next.is_valid() => state = next,
                _ => {
                    tracing::warn!(
                        target = "amms_sync::subscriber",
                        name = self.handler.name(),
                        block_number = log.block_number,
                        log_index = log.log_index,
                        "Log produced an unusable state, regenerating"
                    );
                    return None;
                }
            }
        }

        Some(state)
    }

    async fn regenerate(&self, block_number: u64) -> Result<(), SubscriberError> {
        let generated = self
            .handler
            .generate_state(block_number)
            .await
            .and_then(|state| {
                if state.is_valid() {
                    Ok(state)
                } else {
                    Err(SubscriberError::InvalidGeneratedState {
                        name: self.handler.name().to_string(),
                        block_number,
                    })
                }
            });

        match generated {
            Ok(state) => {
                self.store.set_state(state, block_number);
                self.invalid.store(false, Ordering::SeqCst);
                self.set_status(SyncStatus::Synced);
                tracing::debug!(
                    target = "amms_sync::subscriber",
                    name = self.handler.name(),
                    block_number,
                    "Regenerated state"
                );
                Ok(())
            }
            Err(err) => {
                self.set_status(SyncStatus::Stale);
                tracing::error!(
                    target = "amms_sync::subscriber",
                    name = self.handler.name(),
                    block_number,
                    ?err,
                    "Failed to regenerate state"
                );
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<H: EventHandler> BlockSubscriber for EventSubscriber<H> {
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn on_block(
        &self,
        logs: &[LogEvent],
        header: &BlockHeader,
    ) -> Result<(), SubscriberError> {
        self.update(logs, header).await
    }
}
