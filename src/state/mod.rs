pub mod lens;

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

pub use lens::Lens;

/// Payload stored for a single pool.
///
/// Handlers that detect an inconsistency while applying a log (an amount that can never be zero,
/// an arithmetic underflow, ...) return a state whose `is_valid` is false, which makes the
/// subscriber discard the incremental result and rebuild the state from chain reads.
pub trait PoolState: Clone + Send + Sync + 'static {
    fn is_valid(&self) -> bool {
        true
    }
}

/// A published, immutable version of a pool state.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub state: Arc<T>,
    pub block_number: u64,
    /// Unix timestamp in milliseconds of when this version was published.
    pub last_updated_at: u64,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            block_number: self.block_number,
            last_updated_at: self.last_updated_at,
        }
    }
}

/// Versioned container for "the latest known state as of block N".
///
/// The block number never decreases: a write for an older block than the one currently stored is
/// dropped.
#[derive(Debug)]
pub struct StateStore<T> {
    inner: RwLock<Option<Snapshot<T>>>,
}

impl<T> Default for StateStore<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }
}

impl<T> StateStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `state` as of `block_number`.
    ///
    /// Returns false, leaving the store untouched, if the store already holds a newer block.
    pub fn set_state(&self, state: T, block_number: u64) -> bool {
        self.set_state_at(state, block_number, now_millis())
    }

    /// Same as [`StateStore::set_state`] with an explicit publication timestamp.
    pub fn set_state_at(&self, state: T, block_number: u64, last_updated_at: u64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = inner.as_ref() {
            if block_number < current.block_number {
                tracing::debug!(
                    target = "amms_sync::state",
                    current = current.block_number,
                    block_number,
                    "Dropping state for an older block"
                );
                return false;
            }
        }

        *inner = Some(Snapshot {
            state: Arc::new(state),
            block_number,
            last_updated_at,
        });

        true
    }

    /// Returns the current snapshot if it is at or after `block_number` (or unconditionally when
    /// no block is given). A store that is behind returns `None`; the caller is responsible for
    /// triggering a regeneration.
    pub fn get_state(&self, block_number: Option<u64>) -> Option<Snapshot<T>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = inner.as_ref()?;

        match block_number {
            Some(block_number) if snapshot.block_number < block_number => None,
            _ => Some(snapshot.clone()),
        }
    }

    pub fn block_number(&self) -> Option<u64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|snapshot| snapshot.block_number)
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Drops the stored state. The next write is accepted regardless of its block number.
    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
