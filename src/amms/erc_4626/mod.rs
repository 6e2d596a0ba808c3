use alloy::{
    primitives::{Address, U256},
    sol,
    sol_types::{SolCall, SolEvent},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{consts::U256_10000, error::AMMError, PricingStrategy, Token};
use crate::{
    batch::{decoders::decode_uint256, BatchReader, MultiCallParams, DEFAULT_BATCH_SIZE},
    state::PoolState,
    subscriber::{error::SubscriberError, process_decoded, EventDecoder, EventHandler},
    types::{BlockHeader, LogEvent},
};

sol!(
#[derive(Debug, PartialEq, Eq)]
#[sol(rpc)]
contract IERC4626Vault {
    event Deposit(address indexed sender, address indexed owner, uint256 assets, uint256 shares);
    event Withdraw(address indexed sender, address indexed receiver, address indexed owner, uint256 assets, uint256 shares);
    function totalAssets() external view returns (uint256);
    function totalSupply() external view returns (uint256);
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    /// Total supply of vault tokens
    pub vault_reserve: U256,
    /// Total balance of asset tokens held by vault
    pub asset_reserve: U256,
    /// False once a log did not fit the known reserves.
    consistent: bool,
}

impl VaultState {
    pub const fn new(vault_reserve: U256, asset_reserve: U256) -> Self {
        Self {
            vault_reserve,
            asset_reserve,
            consistent: true,
        }
    }

    const fn inconsistent(self) -> Self {
        Self {
            consistent: false,
            ..self
        }
    }
}

impl PoolState for VaultState {
    fn is_valid(&self) -> bool {
        self.consistent
    }
}

#[derive(Debug)]
pub enum ERC4626Event {
    Deposit(IERC4626Vault::Deposit),
    Withdraw(IERC4626Vault::Withdraw),
}

impl EventDecoder for ERC4626Event {
    fn decode_log(log: &LogEvent) -> Result<Option<Self>, alloy::sol_types::Error> {
        let topics = log.topics.iter().copied();
        match log.signature() {
            Some(signature) if *signature == IERC4626Vault::Deposit::SIGNATURE_HASH => Ok(Some(
                Self::Deposit(IERC4626Vault::Deposit::decode_raw_log(topics, &log.data, true)?),
            )),
            Some(signature) if *signature == IERC4626Vault::Withdraw::SIGNATURE_HASH => Ok(Some(
                Self::Withdraw(IERC4626Vault::Withdraw::decode_raw_log(topics, &log.data, true)?),
            )),
            _ => Ok(None),
        }
    }
}

/// Lending wrapper exchanging vault shares (coin 0) against the underlying asset (coin 1).
#[derive(Debug, Clone)]
pub struct ERC4626Vault {
    /// Token received from depositing, i.e. shares token
    pub vault_token: Token,
    /// Token received from withdrawing, i.e. underlying token
    pub asset_token: Token,
    /// Deposit fee in basis points
    pub deposit_fee: u32,
    /// Withdrawal fee in basis points
    pub withdraw_fee: u32,
    name: String,
    reader: BatchReader,
}

impl ERC4626Vault {
    pub fn new(vault_token: Token, asset_token: Token, reader: BatchReader) -> Self {
        Self {
            name: format!("erc_4626:{}", vault_token.address),
            vault_token,
            asset_token,
            deposit_fee: 0,
            withdraw_fee: 0,
            reader,
        }
    }

    pub fn with_fees(mut self, deposit_fee: u32, withdraw_fee: u32) -> Self {
        self.deposit_fee = deposit_fee;
        self.withdraw_fee = withdraw_fee;
        self
    }

    pub fn address(&self) -> Address {
        self.vault_token.address
    }

    /// Assets received for redeeming `shares`.
    pub fn convert_to_assets(&self, state: &VaultState, shares: U256) -> U256 {
        self.get_amount_out(
            shares,
            state.vault_reserve,
            state.asset_reserve,
            self.withdraw_fee,
        )
    }

    /// Shares minted for depositing `assets`.
    pub fn convert_to_shares(&self, state: &VaultState, assets: U256) -> U256 {
        self.get_amount_out(
            assets,
            state.asset_reserve,
            state.vault_reserve,
            self.deposit_fee,
        )
    }

    fn get_amount_out(&self, amount_in: U256, reserve_in: U256, reserve_out: U256, fee: u32) -> U256 {
        if amount_in.is_zero() {
            return U256::ZERO;
        }

        // Empty vaults mint and redeem one to one
        if reserve_in.is_zero() || reserve_out.is_zero() {
            return amount_in;
        }

        amount_in * reserve_out / reserve_in * U256::from(10000 - fee.min(10000)) / U256_10000
    }
}

impl PricingStrategy for ERC4626Vault {
    type State = VaultState;

    fn compute_output_amount(
        &self,
        state: &VaultState,
        i: usize,
        j: usize,
        amount: U256,
    ) -> Result<U256, AMMError> {
        match (i, j) {
            (0, 1) => Ok(self.convert_to_assets(state, amount)),
            (1, 0) => Ok(self.convert_to_shares(state, amount)),
            _ => Err(AMMError::IncompatibleToken),
        }
    }
}

#[async_trait]
impl EventHandler for ERC4626Vault {
    type State = VaultState;

    fn name(&self) -> &str {
        &self.name
    }

    fn addresses_subscribed(&self) -> Vec<Address> {
        vec![self.address()]
    }

    fn process_log(
        &self,
        state: &VaultState,
        log: &LogEvent,
        _header: &BlockHeader,
    ) -> Option<VaultState> {
        process_decoded(&self.name, state, log, |state, event| {
            let (vault_reserve, asset_reserve, kind) = match event {
                ERC4626Event::Deposit(deposit) => (
                    state.vault_reserve.checked_add(deposit.shares),
                    state.asset_reserve.checked_add(deposit.assets),
                    "Deposit overflows known reserves",
                ),
                ERC4626Event::Withdraw(withdraw) => (
                    state.vault_reserve.checked_sub(withdraw.shares),
                    state.asset_reserve.checked_sub(withdraw.assets),
                    "Withdrawal exceeds known reserves",
                ),
            };

            match (vault_reserve, asset_reserve) {
                (Some(vault_reserve), Some(asset_reserve)) => {
                    Some(VaultState::new(vault_reserve, asset_reserve))
                }
                _ => {
                    tracing::warn!(
                        target = "amms_sync::erc_4626",
                        address = ?self.address(),
                        block_number = log.block_number,
                        "{kind}"
                    );
                    Some(state.inconsistent())
                }
            }
        })
    }

    async fn generate_state(&self, block_number: u64) -> Result<VaultState, SubscriberError> {
        let calls = [
            MultiCallParams::new(
                self.address(),
                IERC4626Vault::totalSupplyCall {}.abi_encode(),
                decode_uint256,
            ),
            MultiCallParams::new(
                self.address(),
                IERC4626Vault::totalAssetsCall {}.abi_encode(),
                decode_uint256,
            ),
        ];

        let outputs = self
            .reader
            .aggregate(&calls, Some(block_number), DEFAULT_BATCH_SIZE)
            .await?;

        let [vault_reserve, asset_reserve]: [_; 2] =
            outputs
                .try_into()
                .map_err(|outputs: Vec<_>| SubscriberError::UnexpectedOutputCount {
                    expected: 2,
                    actual: outputs.len(),
                })?;

        Ok(VaultState::new(vault_reserve?, asset_reserve?))
    }
}
