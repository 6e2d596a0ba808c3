pub mod decoders;
pub mod error;
pub mod provider;

use std::{fmt, sync::Arc};

use alloy::{
    primitives::{Address, Bytes},
    sol_types::SolCall,
};
use async_trait::async_trait;
use error::BatchError;
use futures::future::{join_all, try_join_all};

pub use provider::ProviderMulticall;

/// Number of calls bundled into one multicall request unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// An undecoded call as sent to the multicall contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawCall {
    pub target: Address,
    pub call_data: Bytes,
}

/// Executes bundles of calls in a single read.
///
/// `aggregate` fails as a whole when any call reverts. `try_aggregate` reports a success flag per
/// call; with `require_success` set, a single revert fails the bundle.
#[async_trait]
pub trait MulticallTransport: Send + Sync {
    /// Latest block number known to the node.
    async fn block_number(&self) -> Result<u64, BatchError>;

    async fn aggregate(
        &self,
        calls: Vec<RawCall>,
        block_number: Option<u64>,
    ) -> Result<Vec<Bytes>, BatchError>;

    async fn try_aggregate(
        &self,
        require_success: bool,
        calls: Vec<RawCall>,
        block_number: Option<u64>,
    ) -> Result<Vec<(bool, Bytes)>, BatchError>;
}

type Decoder<T> = Arc<dyn Fn(&[u8]) -> Result<T, BatchError> + Send + Sync>;
type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A call together with the decoder for its return data.
pub struct MultiCallParams<T> {
    pub target: Address,
    pub call_data: Bytes,
    decoder: Decoder<T>,
    callback: Option<Callback<T>>,
}

impl<T> Clone for MultiCallParams<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            call_data: self.call_data.clone(),
            decoder: self.decoder.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<T> fmt::Debug for MultiCallParams<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiCallParams")
            .field("target", &self.target)
            .field("call_data", &self.call_data)
            .finish_non_exhaustive()
    }
}

impl<T> MultiCallParams<T> {
    pub fn new(
        target: Address,
        call_data: impl Into<Bytes>,
        decoder: impl Fn(&[u8]) -> Result<T, BatchError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            target,
            call_data: call_data.into(),
            decoder: Arc::new(decoder),
            callback: None,
        }
    }

    /// Builds a request from a `sol!` generated call, decoding into its return type.
    pub fn from_call<C>(target: Address, call: &C) -> Self
    where
        C: SolCall<Return = T> + 'static,
        T: 'static,
    {
        Self::new(target, call.abi_encode(), |data| {
            Ok(C::abi_decode_returns(data, true)?)
        })
    }

    /// Runs `callback` on the decoded value every time this call decodes successfully.
    pub fn with_callback(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn raw_call(&self) -> RawCall {
        RawCall {
            target: self.target,
            call_data: self.call_data.clone(),
        }
    }

    fn decode(&self, index: usize, data: &[u8]) -> Result<T, BatchError> {
        let value = (self.decoder)(data).inspect_err(|err| {
            tracing::warn!(
                target = "amms_sync::batch",
                index,
                target_address = ?self.target,
                ?err,
                "Failed to decode return data"
            );
        })?;

        if let Some(callback) = &self.callback {
            callback(&value);
        }

        Ok(value)
    }
}

/// Outcome of a single call within `try_aggregate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiResult<T> {
    pub success: bool,
    pub return_data: Option<T>,
}

impl<T> MultiResult<T> {
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            return_data: Some(value),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            return_data: None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        if self.success {
            self.return_data
        } else {
            None
        }
    }
}

/// Bundles many independent reads into as few round trips as possible.
#[derive(Clone)]
pub struct BatchReader {
    transport: Arc<dyn MulticallTransport>,
}

impl fmt::Debug for BatchReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReader").finish_non_exhaustive()
    }
}

impl BatchReader {
    pub fn new(transport: Arc<dyn MulticallTransport>) -> Self {
        Self { transport }
    }

    pub async fn block_number(&self) -> Result<u64, BatchError> {
        self.transport.block_number().await
    }

    /// Executes every call and decodes the results, preserving input order.
    ///
    /// Calls are split into chunks of `batch_size` which are sent concurrently. Any chunk failing
    /// fails the whole aggregation. A decoding failure only affects its own element.
    pub async fn aggregate<T>(
        &self,
        calls: &[MultiCallParams<T>],
        block_number: Option<u64>,
        batch_size: usize,
    ) -> Result<Vec<Result<T, BatchError>>, BatchError> {
        if calls.is_empty() {
            return Ok(vec![]);
        }

        let chunks = calls.chunks(batch_size.max(1)).map(|chunk| {
            let raw = chunk.iter().map(MultiCallParams::raw_call).collect::<Vec<_>>();
            let transport = self.transport.clone();

            async move {
                let requested = raw.len();
                let returned = transport.aggregate(raw, block_number).await?;
                if returned.len() != requested {
                    return Err(BatchError::LengthMismatch {
                        requested,
                        returned: returned.len(),
                    });
                }
                Ok(returned)
            }
        });

        let responses = try_join_all(chunks).await.inspect_err(|err| {
            tracing::error!(
                target = "amms_sync::batch",
                calls = calls.len(),
                ?block_number,
                ?err,
                "Multicall aggregate failed"
            );
        })?;

        Ok(responses
            .into_iter()
            .flatten()
            .zip(calls)
            .enumerate()
            .map(|(index, (data, call))| call.decode(index, &data))
            .collect())
    }

    /// Executes every call, reporting success per call and preserving input order.
    ///
    /// Never fails as a whole: a chunk that cannot be executed marks each of its calls as failed,
    /// and a result that cannot be decoded is reported as failed.
    pub async fn try_aggregate<T>(
        &self,
        require_success: bool,
        calls: &[MultiCallParams<T>],
        block_number: Option<u64>,
        batch_size: usize,
    ) -> Vec<MultiResult<T>> {
        let chunks = calls.chunks(batch_size.max(1)).map(|chunk| {
            let raw = chunk.iter().map(MultiCallParams::raw_call).collect::<Vec<_>>();
            let transport = self.transport.clone();

            async move {
                let requested = raw.len();
                match transport.try_aggregate(require_success, raw, block_number).await {
                    Ok(returned) if returned.len() == requested => returned,
                    Ok(returned) => {
                        tracing::error!(
                            target = "amms_sync::batch",
                            requested,
                            returned = returned.len(),
                            "Multicall returned an unexpected number of results"
                        );
                        vec![(false, Bytes::new()); requested]
                    }
                    Err(err) => {
                        tracing::error!(
                            target = "amms_sync::batch",
                            requested,
                            ?block_number,
                            ?err,
                            "Multicall chunk failed"
                        );
                        vec![(false, Bytes::new()); requested]
                    }
                }
            }
        });

        join_all(chunks)
            .await
            .into_iter()
            .flatten()
            .zip(calls)
            .enumerate()
            .map(|(index, ((success, data), call))| {
                if !success {
                    return MultiResult::failed();
                }
                call.decode(index, &data)
                    .map(MultiResult::ok)
                    .unwrap_or_else(|_| MultiResult::failed())
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use alloy::{
        primitives::{Address, Bytes, U256},
        sol_types::SolValue,
    };

    use super::{decoders::decode_uint256, testing::MockMulticall, *};

    // Each call returns its own index, encoded in the calldata.
    fn echo_transport() -> MockMulticall {
        MockMulticall::new(|call, _| {
            let index = U256::from_be_slice(&call.call_data);
            if index == U256::from(3) {
                None
            } else {
                Some(Bytes::from(index.abi_encode()))
            }
        })
    }

    fn calls(n: usize) -> Vec<MultiCallParams<U256>> {
        (0..n)
            .map(|i| {
                MultiCallParams::new(
                    Address::with_last_byte(i as u8),
                    U256::from(i).to_be_bytes_vec(),
                    decode_uint256,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_aggregate_preserves_order_across_batch_sizes() {
        let transport = Arc::new(MockMulticall::new(|call, _| {
            Some(Bytes::from(U256::from_be_slice(&call.call_data).abi_encode()))
        }));
        let reader = BatchReader::new(transport.clone());
        let calls = calls(10);

        for batch_size in [1, 3, 4, 10, 500] {
            let results = reader.aggregate(&calls, None, batch_size).await.unwrap();
            let values = results.into_iter().map(Result::unwrap).collect::<Vec<_>>();
            assert_eq!(values, (0..10).map(U256::from).collect::<Vec<_>>());
        }

        // 10 + 4 + 3 + 1 + 1 requests for the sizes above
        assert_eq!(transport.requests().len(), 19);
        assert_eq!(&transport.requests()[10..14], &[3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn test_aggregate_fails_when_a_call_reverts() {
        let reader = BatchReader::new(Arc::new(echo_transport()));
        assert!(reader.aggregate(&calls(10), None, 500).await.is_err());
    }

    #[tokio::test]
    async fn test_aggregate_empty() {
        let transport = Arc::new(echo_transport());
        let reader = BatchReader::new(transport.clone());
        let results = reader.aggregate(&calls(0), None, 500).await.unwrap();
        assert!(results.is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_try_aggregate_reports_single_failure() {
        let reader = BatchReader::new(Arc::new(echo_transport()));
        let results = reader.try_aggregate(false, &calls(10), None, 4).await;

        assert_eq!(results.len(), 10);
        for (i, result) in results.iter().enumerate() {
            if i == 3 {
                assert_eq!(result, &MultiResult::failed());
            } else {
                assert_eq!(result, &MultiResult::ok(U256::from(i)));
            }
        }
    }

    #[tokio::test]
    async fn test_try_aggregate_failed_chunk() {
        let transport = Arc::new(
            MockMulticall::new(|call, _| Some(Bytes::from(call.call_data.to_vec()))).fail_request(1),
        );
        let reader = BatchReader::new(transport);
        let results = reader.try_aggregate(false, &calls(9), None, 3).await;

        let successes = results.iter().map(|r| r.success).collect::<Vec<_>>();
        assert_eq!(
            successes,
            vec![true, true, true, false, false, false, true, true, true]
        );
    }

    #[tokio::test]
    async fn test_try_aggregate_decode_failure_is_per_call() {
        let transport = Arc::new(MockMulticall::new(|call, _| {
            if call.target == Address::with_last_byte(2) {
                Some(Bytes::from(vec![0xde, 0xad]))
            } else {
                Some(Bytes::from(U256::from(1).abi_encode()))
            }
        }));
        let reader = BatchReader::new(transport);
        let results = reader.try_aggregate(false, &calls(4), None, 500).await;

        assert!(results[0].success && results[1].success && results[3].success);
        assert!(!results[2].success);
    }

    #[tokio::test]
    async fn test_callback_runs_on_decoded_values() {
        let seen = Arc::new(AtomicUsize::new(0));
        let calls = calls(5)
            .into_iter()
            .map(|call| {
                let seen = seen.clone();
                call.with_callback(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        let reader = BatchReader::new(Arc::new(echo_transport()));
        reader.try_aggregate(false, &calls, None, 2).await;

        // index 3 reverts
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
