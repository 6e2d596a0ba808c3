pub mod cache;
pub mod error;
pub mod liquidity;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use alloy::primitives::{Address, Bytes};
use cache::SharedCache;
use error::PollingError;
use futures::future::join_all;
use liquidity::{merge_responses, HttpLiquiditySource, LiquiditySource};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    batch::{BatchReader, MultiCallParams, MultiResult, RawCall},
    config::{EngineConfig, Role},
    scheduler::TaskScheduler,
    state::{now_millis, PoolState, Snapshot, StateStore},
};

/// Polled state as published to the shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedState<S> {
    pub state: S,
    pub block_number: u64,
    /// Unix timestamp in milliseconds.
    pub updated_at: u64,
}

/// A pool whose state is read periodically instead of being derived from logs.
pub trait PoolPoller<S>: Send + Sync + 'static {
    fn identifier(&self) -> &str;

    fn address(&self) -> Address;

    /// State-only pools (e.g. base pools of meta pools) are polled but never quoted.
    fn is_used_for_pricing(&self) -> bool;

    fn is_src_fee_on_transfer_supported(&self) -> bool {
        false
    }

    /// Path of the liquidity API listing this pool.
    fn liquidity_api_slug(&self) -> &str {
        "/factory"
    }

    fn tokens(&self) -> &[Address];

    fn underlying_tokens(&self) -> &[Address] {
        &[]
    }

    fn state_calls(&self) -> Vec<RawCall>;

    /// Builds the state from the results of [`PoolPoller::state_calls`], in the same order.
    fn parse_results(
        &self,
        results: &[MultiResult<Bytes>],
        block_number: u64,
        updated_at: u64,
    ) -> Result<S, PollingError>;

    fn store(&self) -> &StateStore<S>;

    /// Overrides the engine wide `max_state_age_ms` for this pool.
    fn max_state_age(&self) -> Option<Duration> {
        None
    }

    /// Whether a replica may use `cached` instead of reading the pool over RPC.
    fn is_state_up_to_date(
        &self,
        cached: &CachedState<S>,
        now: u64,
        max_state_age: Duration,
    ) -> bool {
        let max_state_age = self.max_state_age().unwrap_or(max_state_age);
        let fresh = now.saturating_sub(cached.updated_at) <= max_state_age.as_millis() as u64;
        let not_behind = self
            .store()
            .block_number()
            .map_or(true, |current| cached.block_number >= current);
        fresh && not_behind
    }

    fn supports_pair(&self, src: Address, dest: Address) -> bool {
        let within = |tokens: &[Address]| tokens.contains(&src) && tokens.contains(&dest);
        src != dest && (within(self.tokens()) || within(self.underlying_tokens()))
    }
}

/// Registry entry of a [`PollingPoolManager`].
pub struct PolledPool<S: 'static> {
    poller: Arc<dyn PoolPoller<S>>,
    liquidity_usd: RwLock<Option<f64>>,
    stale: AtomicBool,
}

impl<S: 'static> fmt::Debug for PolledPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolledPool")
            .field("identifier", &self.poller.identifier())
            .field("address", &self.poller.address())
            .field("liquidity_usd", &self.liquidity_usd())
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl<S: 'static> PolledPool<S> {
    fn new(poller: Arc<dyn PoolPoller<S>>) -> Self {
        Self {
            poller,
            liquidity_usd: RwLock::new(None),
            stale: AtomicBool::new(false),
        }
    }

    pub fn poller(&self) -> &Arc<dyn PoolPoller<S>> {
        &self.poller
    }

    pub fn identifier(&self) -> &str {
        self.poller.identifier()
    }

    pub fn liquidity_usd(&self) -> Option<f64> {
        *self
            .liquidity_usd
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_liquidity_usd(&self, liquidity_usd: f64) {
        *self
            .liquidity_usd
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(liquidity_usd);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Current state, `None` if the last refresh failed or the state is behind `block_number`.
    pub fn get_state(&self, block_number: Option<u64>) -> Option<Snapshot<S>> {
        if self.is_stale() {
            return None;
        }
        self.poller.store().get_state(block_number)
    }

    /// Stores `state` and clears the stale flag. Returns false, keeping the flag, when the store
    /// already holds a newer block.
    fn publish(&self, state: S, block_number: u64, updated_at: u64) -> bool {
        let accepted = self
            .poller
            .store()
            .set_state_at(state, block_number, updated_at);
        if accepted {
            self.stale.store(false, Ordering::SeqCst);
        }
        accepted
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }
}

struct PollingCore<S: 'static> {
    name: String,
    reader: BatchReader,
    cache: Arc<dyn SharedCache>,
    config: EngineConfig,
    liquidity_source: Option<Arc<dyn LiquiditySource>>,
    pricing_pools: RwLock<BTreeMap<String, Arc<PolledPool<S>>>>,
    state_only_pools: RwLock<BTreeMap<String, Arc<PolledPool<S>>>>,
    liquidity_api_slugs: RwLock<BTreeSet<String>>,
}

/// Keeps the state of polled pools fresh and answers pool lookups for pricing.
///
/// Pools live in two disjoint registries: pricing pools, and state-only pools whose state other
/// pools depend on. State-only pools are refreshed first within each cycle.
pub struct PollingPoolManager<S: 'static> {
    core: Arc<PollingCore<S>>,
    state_task: TaskScheduler,
    liquidity_task: Option<TaskScheduler>,
}

impl<S: 'static> fmt::Debug for PollingPoolManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingPoolManager")
            .field("name", &self.core.name)
            .field("role", &self.core.config.role)
            .finish_non_exhaustive()
    }
}

impl<S> PollingPoolManager<S>
where
    S: PoolState + Serialize + DeserializeOwned,
{
    pub fn new(
        name: impl Into<String>,
        config: EngineConfig,
        reader: BatchReader,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        Self::build(name.into(), config, reader, cache, None)
    }

    /// Same as [`PollingPoolManager::new`], additionally ranking pools by the liquidity reported
    /// by `source`.
    pub fn with_liquidity_source(
        name: impl Into<String>,
        config: EngineConfig,
        reader: BatchReader,
        cache: Arc<dyn SharedCache>,
        source: Arc<dyn LiquiditySource>,
    ) -> Self {
        Self::build(name.into(), config, reader, cache, Some(source))
    }

    /// Same as [`PollingPoolManager::with_liquidity_source`], reading liquidity from the API
    /// configured in `config`.
    pub fn with_http_liquidity_source(
        name: impl Into<String>,
        config: EngineConfig,
        reader: BatchReader,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        let source = Arc::new(HttpLiquiditySource::from_config(&config));
        Self::build(name.into(), config, reader, cache, Some(source))
    }

    fn build(
        name: String,
        config: EngineConfig,
        reader: BatchReader,
        cache: Arc<dyn SharedCache>,
        liquidity_source: Option<Arc<dyn LiquiditySource>>,
    ) -> Self {
        let has_liquidity_source = liquidity_source.is_some();
        let core = Arc::new(PollingCore {
            name: name.clone(),
            reader,
            cache,
            config,
            liquidity_source,
            pricing_pools: RwLock::new(BTreeMap::new()),
            state_only_pools: RwLock::new(BTreeMap::new()),
            liquidity_api_slugs: RwLock::new(BTreeSet::new()),
        });

        let state_core = core.clone();
        let state_task = TaskScheduler::new(
            format!("{name}-state"),
            move || {
                let core = state_core.clone();
                async move { Ok(core.update_pools_in_batch(None).await?) }
            },
            core.config.state_update_period(),
            core.config.state_update_retry_period(),
        );

        let liquidity_task = has_liquidity_source.then(|| {
            let liquidity_core = core.clone();
            TaskScheduler::new(
                format!("{name}-liquidity"),
                move || {
                    let core = liquidity_core.clone();
                    async move { Ok(core.fetch_liquidities().await?) }
                },
                core.config.liquidity_update_period(),
                core.config.liquidity_update_retry_period(),
            )
        });

        Self {
            core,
            state_task,
            liquidity_task,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Key of the shared cache hash holding the serialized state of every pool.
    pub fn cache_state_key(&self) -> String {
        self.core.cache_state_key()
    }

    /// Starts the periodic refresh, with a first cycle right away.
    pub fn initialize_polling_pools(&self) {
        self.state_task.set_timer(Duration::ZERO);
        if let Some(task) = &self.liquidity_task {
            task.set_timer(Duration::ZERO);
        }
    }

    pub fn release_resources(&self) {
        self.state_task.release_resources();
        if let Some(task) = &self.liquidity_task {
            task.release_resources();
        }
    }

    /// Registers a pool used for pricing. Registering it again is a no-op.
    pub fn initialize_new_pool(&self, poller: Arc<dyn PoolPoller<S>>) -> Result<(), PollingError> {
        let identifier = poller.identifier().to_string();
        let mut pricing = self
            .core
            .pricing_pools
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if pricing.contains_key(&identifier) {
            return Ok(());
        }

        if self
            .core
            .state_only_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&identifier)
        {
            return Err(PollingError::AlreadyRegistered {
                manager: self.core.name.clone(),
                identifier,
                registry: "state-only",
            });
        }

        self.core
            .liquidity_api_slugs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(poller.liquidity_api_slug().to_string());

        tracing::debug!(target = "amms_sync::polling", name = %self.core.name, %identifier, "Registered pricing pool");
        pricing.insert(identifier, Arc::new(PolledPool::new(poller)));
        Ok(())
    }

    /// Registers a pool whose state is needed by other pools. Pools flagged as used for pricing
    /// go to the pricing registry instead.
    pub fn initialize_new_pool_for_state(
        &self,
        poller: Arc<dyn PoolPoller<S>>,
    ) -> Result<(), PollingError> {
        if poller.is_used_for_pricing() {
            return self.initialize_new_pool(poller);
        }

        let identifier = poller.identifier().to_string();
        let mut state_only = self
            .core
            .state_only_pools
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if state_only.contains_key(&identifier) {
            tracing::trace!(target = "amms_sync::polling", %identifier, "Already registered");
            return Ok(());
        }

        if self
            .core
            .pricing_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&identifier)
        {
            return Err(PollingError::AlreadyRegistered {
                manager: self.core.name.clone(),
                identifier,
                registry: "pricing",
            });
        }

        state_only.insert(identifier, Arc::new(PolledPool::new(poller)));
        Ok(())
    }

    /// Runs one refresh cycle over every registered pool.
    pub async fn update_pools_in_batch(&self, block_number: Option<u64>) -> Result<(), PollingError> {
        self.core.update_pools_in_batch(block_number).await
    }

    /// Refreshes a single pool, e.g. right after registering it.
    pub async fn initialize_individual_polling_pool_state(
        &self,
        identifier: &str,
        is_src_fee_on_transfer: bool,
        block_number: Option<u64>,
    ) -> Result<(), PollingError> {
        let Some(pool) = self.get_pool(identifier, is_src_fee_on_transfer) else {
            tracing::error!(target = "amms_sync::polling", %identifier, "Can not initialize state of unknown pool");
            return Ok(());
        };

        self.core.update_pools(vec![pool], block_number).await
    }

    pub async fn fetch_liquidities(&self) -> Result<(), PollingError> {
        self.core.fetch_liquidities().await
    }

    /// Looks a pool up in the pricing registry, then in the state-only registry. Pools that do not
    /// support fee-on-transfer source tokens are skipped when one is being exchanged.
    pub fn get_pool(
        &self,
        identifier: &str,
        is_src_fee_on_transfer: bool,
    ) -> Option<Arc<PolledPool<S>>> {
        let accepts = |pool: &Arc<PolledPool<S>>| {
            !is_src_fee_on_transfer || pool.poller.is_src_fee_on_transfer_supported()
        };

        let pricing = self
            .core
            .pricing_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .filter(|pool| accepts(pool))
            .cloned();

        pricing.or_else(|| {
            self.core
                .state_only_pools
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(identifier)
                .filter(|pool| accepts(pool))
                .cloned()
        })
    }

    pub fn get_pools_for_pair(
        &self,
        src: Address,
        dest: Address,
        is_src_fee_on_transfer: bool,
    ) -> Vec<Arc<PolledPool<S>>> {
        self.core
            .pricing_pools()
            .into_iter()
            .filter(|pool| !is_src_fee_on_transfer || pool.poller.is_src_fee_on_transfer_supported())
            .filter(|pool| pool.poller.supports_pair(src, dest))
            .collect()
    }

    pub fn get_pools_with_token(&self, token: Address) -> Vec<Arc<PolledPool<S>>> {
        self.core
            .pricing_pools()
            .into_iter()
            .filter(|pool| {
                pool.poller.tokens().contains(&token)
                    || pool.poller.underlying_tokens().contains(&token)
            })
            .collect()
    }

    /// Pricing pools holding `token`, by decreasing USD liquidity. Pools with unknown liquidity
    /// come last.
    pub fn get_top_pools(&self, token: Address, limit: usize) -> Vec<Arc<PolledPool<S>>> {
        let mut pools = self.get_pools_with_token(token);
        pools.sort_by(|a, b| {
            let a = a.liquidity_usd().unwrap_or(-1.0);
            let b = b.liquidity_usd().unwrap_or(-1.0);
            b.total_cmp(&a)
        });
        pools.truncate(limit);
        pools
    }
}

impl<S> PollingCore<S>
where
    S: PoolState + Serialize + DeserializeOwned,
{
    fn cache_state_key(&self) -> String {
        format!("{}_{}_states", self.config.network, self.name).to_lowercase()
    }

    fn liquidity_cache_key(&self) -> String {
        format!("{}_{}_liquidity", self.config.network, self.name).to_lowercase()
    }

    fn pricing_pools(&self) -> Vec<Arc<PolledPool<S>>> {
        self.pricing_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// State-only pools first, their state may be read while parsing the pricing pools.
    fn all_pools(&self) -> Vec<Arc<PolledPool<S>>> {
        let mut pools = self
            .state_only_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        pools.extend(self.pricing_pools());
        pools
    }

    async fn update_pools_in_batch(&self, block_number: Option<u64>) -> Result<(), PollingError> {
        self.update_pools(self.all_pools(), block_number).await
    }

    async fn update_pools(
        &self,
        pools: Vec<Arc<PolledPool<S>>>,
        block_number: Option<u64>,
    ) -> Result<(), PollingError> {
        if pools.is_empty() {
            return Ok(());
        }

        let block_number = match block_number {
            Some(block_number) => block_number,
            None => match self.reader.block_number().await {
                Ok(block_number) => block_number,
                Err(err) => {
                    tracing::error!(
                        target = "amms_sync::polling",
                        name = %self.name,
                        ?err,
                        "Failed to read the latest block, marking pools stale"
                    );
                    pools.iter().for_each(|pool| pool.mark_stale());
                    return Err(err.into());
                }
            },
        };

        match self.config.role {
            Role::Master => self.master_update(&pools, block_number).await,
            Role::Replica => self.replica_update(&pools, block_number).await,
        }

        tracing::trace!(
            target = "amms_sync::polling",
            name = %self.name,
            pools = pools.len(),
            block_number,
            "Finished state update"
        );

        Ok(())
    }

    async fn master_update(&self, pools: &[Arc<PolledPool<S>>], block_number: u64) {
        let states = self.fetch_and_set_states(pools, block_number).await;
        let key = self.cache_state_key();

        let writes = pools
            .iter()
            .zip(states)
            .filter_map(|(pool, state)| Some((pool, state?)))
            .map(|(pool, state)| {
                let key = &key;
                async move {
                    let value = serde_json::to_string(&state)?;
                    self.cache.hset(key, pool.identifier(), value).await?;
                    Ok::<_, PollingError>(())
                }
            });

        let failed = join_all(writes)
            .await
            .into_iter()
            .filter_map(Result::err)
            .inspect(|err| {
                tracing::error!(target = "amms_sync::polling", name = %self.name, ?err, "Failed to publish state");
            })
            .count();

        tracing::info!(
            target = "amms_sync::polling",
            name = %self.name,
            network = %self.config.network,
            pools = pools.len(),
            failed,
            block_number,
            "Updated pool states"
        );
    }

    async fn replica_update(&self, pools: &[Arc<PolledPool<S>>], block_number: u64) {
        let key = self.cache_state_key();
        let now = now_millis();
        let max_state_age = self.config.max_state_age();

        let lookups = pools.iter().map(|pool| {
            let key = &key;
            async move {
                match self.read_cached_state(key, pool).await {
                    Ok(Some(cached))
                        if pool.poller.is_state_up_to_date(&cached, now, max_state_age) =>
                    {
                        pool.publish(cached.state, cached.block_number, cached.updated_at);
                        None
                    }
                    Ok(_) => Some(pool.clone()),
                    Err(err) => {
                        tracing::error!(
                            target = "amms_sync::polling",
                            identifier = pool.identifier(),
                            ?err,
                            "Failed to read state from cache"
                        );
                        Some(pool.clone())
                    }
                }
            }
        });

        let missing = join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        if !missing.is_empty() {
            tracing::warn!(
                target = "amms_sync::polling",
                name = %self.name,
                pools = missing.len(),
                "Pools without fresh cached state, falling back to RPC"
            );
            self.fetch_and_set_states(&missing, block_number).await;
        }
    }

    async fn read_cached_state(
        &self,
        key: &str,
        pool: &PolledPool<S>,
    ) -> Result<Option<CachedState<S>>, PollingError> {
        match self.cache.hget(key, pool.identifier()).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Reads the state of every pool in one `try_aggregate` and publishes what could be parsed.
    /// Pools that failed are marked stale.
    async fn fetch_and_set_states(
        &self,
        pools: &[Arc<PolledPool<S>>],
        block_number: u64,
    ) -> Vec<Option<CachedState<S>>> {
        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(pools.len());
        let mut params = vec![];

        for pool in pools {
            let calls = pool.poller.state_calls();
            ranges.push(params.len()..params.len() + calls.len());
            params.extend(calls.into_iter().map(|call| {
                MultiCallParams::new(call.target, call.call_data, |data| {
                    Ok(Bytes::copy_from_slice(data))
                })
            }));
        }

        let results = self
            .reader
            .try_aggregate(false, &params, Some(block_number), self.config.batch_size)
            .await;
        let updated_at = now_millis();

        pools
            .iter()
            .zip(ranges)
            .map(|(pool, range)| {
                let parsed = results
                    .get(range.clone())
                    .ok_or_else(|| PollingError::UnexpectedResultCount {
                        identifier: pool.identifier().to_string(),
                        expected: range.len(),
                        actual: results.len().saturating_sub(range.start),
                    })
                    .and_then(|results| {
                        pool.poller.parse_results(results, block_number, updated_at)
                    });

                match parsed {
                    Ok(state) => {
                        if !pool.publish(state.clone(), block_number, updated_at) {
                            tracing::debug!(
                                target = "amms_sync::polling",
                                identifier = pool.identifier(),
                                block_number,
                                "Store already holds a newer block"
                            );
                            return None;
                        }
                        Some(CachedState {
                            state,
                            block_number,
                            updated_at,
                        })
                    }
                    Err(err) => {
                        tracing::error!(
                            target = "amms_sync::polling",
                            identifier = pool.identifier(),
                            address = ?pool.poller.address(),
                            block_number,
                            ?err,
                            "Failed to update pool state"
                        );
                        pool.mark_stale();
                        None
                    }
                }
            })
            .collect()
    }

    async fn fetch_liquidities(&self) -> Result<(), PollingError> {
        let Some(source) = &self.liquidity_source else {
            return Ok(());
        };
        let key = self.liquidity_cache_key();

        if self.config.role == Role::Replica {
            match self.cache.get(&key).await {
                Ok(Some(value)) => {
                    let liquidities = serde_json::from_str::<Vec<(Address, f64)>>(&value)?;
                    self.apply_liquidities(&liquidities.into_iter().collect());
                    return Ok(());
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(target = "amms_sync::polling", ?err, "Failed to read liquidity from cache");
                }
            }
        }

        let slugs = self
            .liquidity_api_slugs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<Vec<_>>();

        let responses = join_all(slugs.iter().map(|slug| source.fetch(slug)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .inspect_err(|err| {
                tracing::error!(target = "amms_sync::polling", name = %self.name, ?err, "Liquidity request failed, keeping previous values");
            })?;

        let Some(liquidities) = merge_responses(&responses) else {
            tracing::error!(
                target = "amms_sync::polling",
                name = %self.name,
                network = %self.config.network,
                "Some liquidity requests were unsuccessful, keeping previous values"
            );
            return Err(PollingError::LiquidityUnavailable);
        };

        self.apply_liquidities(&liquidities);

        if self.config.role == Role::Master {
            let value = serde_json::to_string(&liquidities.into_iter().collect::<Vec<_>>())?;
            if let Err(err) = self
                .cache
                .setex(&key, self.config.liquidity_cache_ttl_secs, value)
                .await
            {
                tracing::error!(target = "amms_sync::polling", ?err, "Failed to publish liquidity");
            }
        }

        Ok(())
    }

    fn apply_liquidities(&self, liquidities: &HashMap<Address, f64>) {
        for pool in self.pricing_pools() {
            match liquidities.get(&pool.poller.address()) {
                Some(liquidity_usd) => pool.set_liquidity_usd(*liquidity_usd),
                None => tracing::error!(
                    target = "amms_sync::polling",
                    name = %self.name,
                    address = ?pool.poller.address(),
                    "Pool is missing from the liquidity API"
                ),
            }
        }
    }
}
