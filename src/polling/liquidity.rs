use std::collections::HashMap;

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::PollingError;
use crate::config::EngineConfig;

/// Response body of the Curve pool listing API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiquidityResponse {
    pub success: bool,
    #[serde(default)]
    pub data: LiquidityData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityData {
    #[serde(default)]
    pub pool_data: Vec<PoolLiquidity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolLiquidity {
    pub address: Address,
    #[serde(default)]
    pub usd_total: Option<f64>,
    #[serde(default)]
    pub usd_total_excluding_base_pool: Option<f64>,
}

impl PoolLiquidity {
    /// Total USD liquidity, falling back to the amount excluding the base pool when the total is
    /// missing or zero.
    pub fn usd(&self) -> f64 {
        match self.usd_total {
            Some(total) if total != 0.0 => total,
            _ => self.usd_total_excluding_base_pool.unwrap_or_default(),
        }
    }
}

/// Source of USD liquidity per pool, queried per API slug (e.g. `/factory`).
#[async_trait]
pub trait LiquiditySource: Send + Sync {
    async fn fetch(&self, slug: &str) -> Result<LiquidityResponse, PollingError>;
}

#[derive(Debug, Clone)]
pub struct HttpLiquiditySource {
    client: reqwest::Client,
    base_url: String,
    network: String,
}

impl HttpLiquiditySource {
    pub fn new(base_url: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            network: network.into(),
        }
    }

    /// Source for the API and network configured in `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.liquidity_api_url, &config.network)
    }

    pub fn url(&self, slug: &str) -> String {
        format!(
            "{}/{}{}",
            self.base_url.trim_end_matches('/'),
            self.network,
            slug
        )
    }
}

#[async_trait]
impl LiquiditySource for HttpLiquiditySource {
    async fn fetch(&self, slug: &str) -> Result<LiquidityResponse, PollingError> {
        let url = self.url(slug);
        tracing::debug!(target = "amms_sync::polling", %url, "Fetching pool liquidity");

        Ok(self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<LiquidityResponse>()
            .await?)
    }
}

/// Merges the responses of every slug. All or nothing: `None` if any response is unsuccessful.
pub fn merge_responses(responses: &[LiquidityResponse]) -> Option<HashMap<Address, f64>> {
    if responses.iter().any(|response| !response.success) {
        return None;
    }

    Some(
        responses
            .iter()
            .flat_map(|response| &response.data.pool_data)
            .map(|pool| (pool.address, pool.usd()))
            .collect(),
    )
}
