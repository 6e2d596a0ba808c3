use std::hash::{Hash, Hasher};

use alloy::primitives::{Address, U256};
use error::AMMError;
use serde::{Deserialize, Serialize};

use crate::state::Snapshot;

pub mod consts;
pub mod curve;
pub mod erc_4626;
pub mod error;
pub mod uniswap_v2;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub const fn new_with_decimals(address: Address, decimals: u8) -> Self {
        Self { address, decimals }
    }

    pub const fn address(&self) -> &Address {
        &self.address
    }

    pub const fn decimals(&self) -> u8 {
        self.decimals
    }
}

impl From<Address> for Token {
    fn from(address: Address) -> Self {
        Self {
            address,
            decimals: 0,
        }
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Pure pricing of a pool from one of its state snapshots.
pub trait PricingStrategy: Send + Sync {
    type State;

    /// Amount of coin `j` received for `amount` of coin `i`.
    fn compute_output_amount(
        &self,
        state: &Self::State,
        i: usize,
        j: usize,
        amount: U256,
    ) -> Result<U256, AMMError>;
}

/// A pool offered for a quote, along with the state it should be priced from.
pub struct QuoteCandidate<'a, P: PricingStrategy> {
    pub identifier: &'a str,
    pub pricing: &'a P,
    /// `None` when the pool state can not currently be determined.
    pub snapshot: Option<Snapshot<P::State>>,
    pub i: usize,
    pub j: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub identifier: String,
    pub block_number: u64,
    pub amounts_out: Vec<U256>,
}

/// Prices `amounts` on every candidate.
///
/// Pools without a usable state, or for which any amount fails to price, are left out of the
/// result instead of failing the whole request.
pub fn quote_pools<'a, P>(
    candidates: impl IntoIterator<Item = QuoteCandidate<'a, P>>,
    amounts: &[U256],
) -> Vec<Quote>
where
    P: PricingStrategy + 'a,
{
    candidates
        .into_iter()
        .filter_map(|candidate| {
            let Some(snapshot) = candidate.snapshot else {
                tracing::debug!(
                    target = "amms_sync::amms",
                    identifier = candidate.identifier,
                    "Excluding pool without state"
                );
                return None;
            };

            let amounts_out = amounts
                .iter()
                .map(|amount| {
                    candidate.pricing.compute_output_amount(
                        &snapshot.state,
                        candidate.i,
                        candidate.j,
                        *amount,
                    )
                })
                .collect::<Result<Vec<_>, _>>()
                .inspect_err(|err| {
                    tracing::warn!(
                        target = "amms_sync::amms",
                        identifier = candidate.identifier,
                        block_number = snapshot.block_number,
                        ?err,
                        "Excluding pool that failed to price"
                    );
                })
                .ok()?;

            Some(Quote {
                identifier: candidate.identifier.to_string(),
                block_number: snapshot.block_number,
                amounts_out,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy::primitives::U256;

    use super::*;

    /// Pays out `amount * rate`, fails above `limit`.
    struct Linear {
        limit: U256,
    }

    impl PricingStrategy for Linear {
        type State = U256;

        fn compute_output_amount(
            &self,
            rate: &U256,
            _i: usize,
            _j: usize,
            amount: U256,
        ) -> Result<U256, AMMError> {
            if amount > self.limit {
                return Err(AMMError::DidNotConverge {
                    function: "linear",
                    rounds: 255,
                });
            }
            Ok(amount * rate)
        }
    }

    fn snapshot(rate: u64, block_number: u64) -> Option<Snapshot<U256>> {
        Some(Snapshot {
            state: Arc::new(U256::from(rate)),
            block_number,
            last_updated_at: 0,
        })
    }

    #[test]
    fn test_unavailable_and_failing_pools_are_excluded() {
        let small = Linear {
            limit: U256::from(10),
        };
        let large = Linear { limit: U256::MAX };

        let candidates = vec![
            QuoteCandidate {
                identifier: "small",
                pricing: &small,
                snapshot: snapshot(2, 5),
                i: 0,
                j: 1,
            },
            QuoteCandidate {
                identifier: "missing",
                pricing: &large,
                snapshot: None,
                i: 0,
                j: 1,
            },
            QuoteCandidate {
                identifier: "large",
                pricing: &large,
                snapshot: snapshot(3, 6),
                i: 0,
                j: 1,
            },
        ];

        let quotes = quote_pools(candidates, &[U256::from(1), U256::from(100)]);

        assert_eq!(
            quotes,
            vec![Quote {
                identifier: "large".to_string(),
                block_number: 6,
                amounts_out: vec![U256::from(3), U256::from(300)],
            }]
        );
    }
}
