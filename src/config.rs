use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_BATCH_SIZE;

/// Which instance of a deployment writes polled state to the shared cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Master,
    Replica,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Network name, used in cache keys and liquidity API paths.
    pub network: String,
    pub role: Role,
    pub batch_size: usize,
    pub state_update_period_ms: u64,
    pub state_update_retry_period_ms: u64,
    /// Cached polled state older than this is refetched by replicas, unless the pool sets its own
    /// limit.
    pub max_state_age_ms: u64,
    pub liquidity_update_period_ms: u64,
    pub liquidity_update_retry_period_ms: u64,
    pub liquidity_cache_ttl_secs: u64,
    /// Base URL of the pool listing API, the network and slug are appended.
    pub liquidity_api_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: "ethereum".to_string(),
            role: Role::Master,
            batch_size: DEFAULT_BATCH_SIZE,
            state_update_period_ms: 60_000,
            state_update_retry_period_ms: 2_000,
            max_state_age_ms: 120_000,
            liquidity_update_period_ms: 3_600_000,
            liquidity_update_retry_period_ms: 300_000,
            liquidity_cache_ttl_secs: 3_600,
            liquidity_api_url: "https://api.curve.fi/api/getPools".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_state_update_period(mut self, period: Duration, retry_period: Duration) -> Self {
        self.state_update_period_ms = period.as_millis() as u64;
        self.state_update_retry_period_ms = retry_period.as_millis() as u64;
        self
    }

    pub fn with_max_state_age(mut self, max_age: Duration) -> Self {
        self.max_state_age_ms = max_age.as_millis() as u64;
        self
    }

    pub fn with_liquidity_update_period(
        mut self,
        period: Duration,
        retry_period: Duration,
    ) -> Self {
        self.liquidity_update_period_ms = period.as_millis() as u64;
        self.liquidity_update_retry_period_ms = retry_period.as_millis() as u64;
        self
    }

    pub fn with_liquidity_cache_ttl(mut self, ttl: Duration) -> Self {
        self.liquidity_cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_liquidity_api_url(mut self, url: impl Into<String>) -> Self {
        self.liquidity_api_url = url.into();
        self
    }

    pub fn state_update_period(&self) -> Duration {
        Duration::from_millis(self.state_update_period_ms)
    }

    pub fn state_update_retry_period(&self) -> Duration {
        Duration::from_millis(self.state_update_retry_period_ms)
    }

    pub fn max_state_age(&self) -> Duration {
        Duration::from_millis(self.max_state_age_ms)
    }

    pub fn liquidity_update_period(&self) -> Duration {
        Duration::from_millis(self.liquidity_update_period_ms)
    }

    pub fn liquidity_update_retry_period(&self) -> Duration {
        Duration::from_millis(self.liquidity_update_retry_period_ms)
    }

    pub fn is_replica(&self) -> bool {
        self.role == Role::Replica
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.state_update_period(), Duration::from_secs(60));
        assert_eq!(config.state_update_retry_period(), Duration::from_secs(2));
        assert_eq!(config.liquidity_update_period(), Duration::from_secs(3_600));
        assert_eq!(config.liquidity_update_retry_period(), Duration::from_secs(300));
        assert!(!config.is_replica());
    }

    #[test]
    fn test_partial_deserialization() -> eyre::Result<()> {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "network": "arbitrum", "role": "replica", "batch_size": 100 }"#)?;

        assert_eq!(config.network, "arbitrum");
        assert_eq!(config.role, Role::Replica);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.state_update_period_ms, 60_000);
        Ok(())
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_role(Role::Replica)
            .with_state_update_period(Duration::from_secs(10), Duration::from_millis(500))
            .with_liquidity_cache_ttl(Duration::from_secs(90));

        assert!(config.is_replica());
        assert_eq!(config.state_update_period_ms, 10_000);
        assert_eq!(config.state_update_retry_period_ms, 500);
        assert_eq!(config.liquidity_cache_ttl_secs, 90);
    }
}
