use std::{collections::HashMap, fmt, ops::Range};

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use futures::future::try_join_all;

use super::{error::SubscriberError, EventHandler};
use crate::{
    batch::{BatchReader, MultiCallParams, RawCall, DEFAULT_BATCH_SIZE},
    state::{Lens, PoolState},
    types::{BlockHeader, LogEvent},
};

/// A child of a [`ComposedSubscriber`], owning the part of the composite its lens focuses on.
#[async_trait]
pub trait PartialSubscriber<W>: Send + Sync + 'static {
    type Part: Clone + Send + Sync + 'static;

    fn addresses_subscribed(&self) -> Vec<Address>;

    fn lens(&self) -> &Lens<W, Self::Part>;

    fn process_log(
        &self,
        part: &Self::Part,
        log: &LogEvent,
        header: &BlockHeader,
    ) -> Option<Self::Part>;

    /// Calls whose results feed [`PartialSubscriber::generate_state`].
    fn generate_state_calls(&self) -> Vec<RawCall>;

    /// Builds the part from the raw results of [`PartialSubscriber::generate_state_calls`], in
    /// the same order.
    async fn generate_state(
        &self,
        outputs: &[Bytes],
        block_number: u64,
    ) -> Result<Self::Part, SubscriberError>;
}

type Setter<W> = Box<dyn FnOnce(&W) -> W + Send>;

#[async_trait]
trait Child<W>: Send + Sync {
    fn apply_log(&self, whole: &W, log: &LogEvent, header: &BlockHeader) -> Option<W>;

    async fn generate(&self, outputs: &[Bytes], block_number: u64)
        -> Result<Setter<W>, SubscriberError>;
}

#[async_trait]
impl<W, P> Child<W> for P
where
    W: Send + Sync + 'static,
    P: PartialSubscriber<W>,
{
    fn apply_log(&self, whole: &W, log: &LogEvent, header: &BlockHeader) -> Option<W> {
        let lens = self.lens();
        let part = self.process_log(&lens.get(whole), log, header)?;
        Some(lens.set(part, whole))
    }

    async fn generate(
        &self,
        outputs: &[Bytes],
        block_number: u64,
    ) -> Result<Setter<W>, SubscriberError> {
        let part = self.generate_state(outputs, block_number).await?;
        let lens = self.lens().clone();
        Ok(Box::new(move |whole: &W| lens.set(part, whole)))
    }
}

/// Event handler assembled from child subscribers, each responsible for one part of a composite
/// state.
///
/// Regeneration issues the calls of every child in a single multicall and folds the generated
/// parts into `blank` through the children's lenses.
pub struct ComposedSubscriber<W> {
    name: String,
    reader: BatchReader,
    batch_size: usize,
    blank: W,
    children: Vec<Box<dyn Child<W>>>,
    /// Children interested in each address, in registration order.
    address_children: HashMap<Address, Vec<usize>>,
    addresses: Vec<Address>,
    calls: Vec<RawCall>,
    call_ranges: Vec<Range<usize>>,
}

impl<W> fmt::Debug for ComposedSubscriber<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedSubscriber")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

impl<W: PoolState> ComposedSubscriber<W> {
    pub fn new(name: impl Into<String>, reader: BatchReader, blank: W) -> Self {
        Self {
            name: name.into(),
            reader,
            batch_size: DEFAULT_BATCH_SIZE,
            blank,
            children: vec![],
            address_children: HashMap::new(),
            addresses: vec![],
            calls: vec![],
            call_ranges: vec![],
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_part<P: PartialSubscriber<W>>(mut self, part: P) -> Self {
        let index = self.children.len();

        for address in part.addresses_subscribed() {
            let children = self.address_children.entry(address).or_default();
            if children.is_empty() {
                self.addresses.push(address);
            }
            if !children.contains(&index) {
                children.push(index);
            }
        }

        let calls = part.generate_state_calls();
        let start = self.calls.len();
        self.call_ranges.push(start..start + calls.len());
        self.calls.extend(calls);

        self.children.push(Box::new(part));
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl<W: PoolState> EventHandler for ComposedSubscriber<W> {
    type State = W;

    fn name(&self) -> &str {
        &self.name
    }

    fn addresses_subscribed(&self) -> Vec<Address> {
        self.addresses.clone()
    }

    fn process_log(&self, state: &W, log: &LogEvent, header: &BlockHeader) -> Option<W> {
        let Some(children) = self.address_children.get(&log.address) else {
            tracing::warn!(
                target = "amms_sync::subscriber",
                name = %self.name,
                address = ?log.address,
                "Log from an address no part subscribed to"
            );
            return None;
        };

        let mut whole: Option<W> = None;
        for &index in children {
            let current = whole.as_ref().unwrap_or(state);
            whole = Some(self.children[index].apply_log(current, log, header)?);
        }

        whole
    }

    async fn generate_state(&self, block_number: u64) -> Result<W, SubscriberError> {
        let params = self
            .calls
            .iter()
            .map(|call| {
                MultiCallParams::new(call.target, call.call_data.clone(), |data| {
                    Ok(Bytes::copy_from_slice(data))
                })
            })
            .collect::<Vec<_>>();

        let outputs = self
            .reader
            .aggregate(&params, Some(block_number), self.batch_size)
            .await?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let setters = try_join_all(
            self.children
                .iter()
                .zip(&self.call_ranges)
                .map(|(child, range)| child.generate(&outputs[range.clone()], block_number)),
        )
        .await?;

        Ok(setters
            .into_iter()
            .fold(self.blank.clone(), |whole, set| set(&whole)))
    }
}
