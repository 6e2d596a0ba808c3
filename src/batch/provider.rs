use std::sync::Arc;

use alloy::{
    eips::BlockId,
    network::Network,
    primitives::{address, Address, Bytes},
    providers::Provider,
    sol,
    transports::Transport,
};
use async_trait::async_trait;
use IMulticall3::IMulticall3Instance;

use super::{error::BatchError, MulticallTransport, RawCall};

/// Multicall3 is deployed at the same address on most EVM chains.
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

sol!(
#[allow(missing_docs)]
#[derive(Debug)]
#[sol(rpc)]
contract IMulticall3 {
    struct Call {
        address target;
        bytes callData;
    }

    struct CallResult {
        bool success;
        bytes returnData;
    }

    function aggregate(Call[] calldata calls) external payable returns (uint256 blockNumber, bytes[] memory returnData);
    function tryAggregate(bool requireSuccess, Call[] calldata calls) external payable returns (CallResult[] memory returnData);
});

impl From<RawCall> for IMulticall3::Call {
    fn from(call: RawCall) -> Self {
        Self {
            target: call.target,
            callData: call.call_data,
        }
    }
}

/// [`MulticallTransport`] backed by a Multicall3 contract reached through an alloy provider.
#[derive(Debug)]
pub struct ProviderMulticall<T, N, P> {
    multicall: IMulticall3Instance<T, Arc<P>, N>,
}

impl<T, N, P> ProviderMulticall<T, N, P>
where
    T: Transport + Clone,
    N: Network,
    P: Provider<T, N>,
{
    pub fn new(provider: Arc<P>) -> Self {
        Self::with_address(MULTICALL3_ADDRESS, provider)
    }

    pub fn with_address(address: Address, provider: Arc<P>) -> Self {
        Self {
            multicall: IMulticall3Instance::new(address, provider),
        }
    }
}

fn block_id(block_number: Option<u64>) -> BlockId {
    block_number.map(BlockId::number).unwrap_or_else(BlockId::latest)
}

#[async_trait]
impl<T, N, P> MulticallTransport for ProviderMulticall<T, N, P>
where
    T: Transport + Clone,
    N: Network,
    P: Provider<T, N> + 'static,
{
    async fn block_number(&self) -> Result<u64, BatchError> {
        Ok(self.multicall.provider().get_block_number().await?)
    }

    async fn aggregate(
        &self,
        calls: Vec<RawCall>,
        block_number: Option<u64>,
    ) -> Result<Vec<Bytes>, BatchError> {
        let calls = calls.into_iter().map(Into::into).collect();
        let result = self
            .multicall
            .aggregate(calls)
            .block(block_id(block_number))
            .call()
            .await?;

        Ok(result.returnData)
    }

    async fn try_aggregate(
        &self,
        require_success: bool,
        calls: Vec<RawCall>,
        block_number: Option<u64>,
    ) -> Result<Vec<(bool, Bytes)>, BatchError> {
        let calls = calls.into_iter().map(Into::into).collect();
        let result = self
            .multicall
            .tryAggregate(require_success, calls)
            .block(block_id(block_number))
            .call()
            .await?;

        Ok(result
            .returnData
            .into_iter()
            .map(|call_result| (call_result.success, call_result.returnData))
            .collect())
    }
}
