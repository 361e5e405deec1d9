use std::sync::Arc;

use ethers::{
    abi::RawLog,
    contract::EthEvent,
    types::{Address, Log, TransactionReceipt, H256, U64},
};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

use super::{
    error::EthRpcError, BundlerStatusResponse, ClearMempoolResponse, RateLimiter,
    RichUserOperation, RpcUserOperation, UserOperationReceipt,
};
use crate::{
    bundler::SharedBundlerStatus,
    common::contracts::UserOperationEventFilter,
    entrypoint::{EntryPointLike, GasEstimate},
    mempool::Mempool,
};

/// Eth API
#[rpc(server, namespace = "eth")]
pub trait EthApi {
    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U64>;

    #[method(name = "supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>>;

    #[method(name = "estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<GasEstimate>;

    #[method(name = "sendUserOperation")]
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<H256>;

    #[method(name = "getUserOperationByHash")]
    async fn get_user_operation_by_hash(&self, hash: H256)
        -> RpcResult<Option<RichUserOperation>>;

    #[method(name = "getUserOperationReceipt")]
    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>>;

    #[method(name = "bundler_clearMempool")]
    async fn bundler_clear_mempool(&self) -> RpcResult<ClearMempoolResponse>;

    #[method(name = "bundler_getStatus")]
    async fn bundler_get_status(&self) -> RpcResult<BundlerStatusResponse>;
}

pub struct EthApi<M, E> {
    chain_id: u64,
    mempool: Arc<M>,
    entry_point: Arc<E>,
    bundler_status: SharedBundlerStatus,
    rate_limiter: Arc<RateLimiter>,
}

impl<M, E> EthApi<M, E>
where
    M: Mempool,
    E: EntryPointLike,
{
    pub fn new(
        chain_id: u64,
        mempool: Arc<M>,
        entry_point: Arc<E>,
        bundler_status: SharedBundlerStatus,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            chain_id,
            mempool,
            entry_point,
            bundler_status,
            rate_limiter,
        }
    }

    /// Only the configured EntryPoint is served; anything else is an invalid
    /// parameter. Address equality is case-insensitive by construction.
    fn check_entry_point(&self, entry_point: Address) -> Result<(), EthRpcError> {
        if entry_point != self.entry_point.address() {
            return Err(EthRpcError::InvalidParams(format!(
                "unsupported entry point: {entry_point:?}"
            )));
        }
        Ok(())
    }

    fn check_rate_limit(&self) -> Result<(), EthRpcError> {
        if !self.rate_limiter.try_acquire() {
            return Err(EthRpcError::RateLimited);
        }
        Ok(())
    }
}

#[jsonrpsee::core::async_trait]
impl<M, E> EthApiServer for EthApi<M, E>
where
    M: Mempool,
    E: EntryPointLike,
{
    async fn chain_id(&self) -> RpcResult<U64> {
        Ok(self.chain_id.into())
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>> {
        Ok(vec![self.entry_point.address()])
    }

    async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<GasEstimate> {
        self.check_rate_limit()?;
        self.check_entry_point(entry_point)?;
        let estimate = self
            .entry_point
            .estimate_op_gas(op.into())
            .await
            .map_err(EthRpcError::from)?;
        Ok(estimate)
    }

    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<H256> {
        self.check_rate_limit()?;
        self.check_entry_point(entry_point)?;
        let record = self
            .mempool
            .add_operation(op.into())
            .await
            .map_err(EthRpcError::from)?;
        Ok(record.hash)
    }

    async fn get_user_operation_by_hash(
        &self,
        hash: H256,
    ) -> RpcResult<Option<RichUserOperation>> {
        if hash == H256::zero() {
            return Err(EthRpcError::InvalidParams("hash cannot be zero".to_string()))?;
        }
        let Some(record) = self
            .mempool
            .get_operation(hash)
            .await
            .map_err(EthRpcError::from)?
        else {
            return Ok(None);
        };

        // The block hash only exists on-chain; recover it from the receipt
        // once the operation's bundle transaction is known.
        let mut block_hash = None;
        let mut block_number = record.block_number.map(U64::from);
        if let Some(tx_hash) = record.transaction_hash {
            if let Some(receipt) = self
                .entry_point
                .get_receipt(tx_hash)
                .await
                .map_err(EthRpcError::from)?
            {
                block_hash = receipt.block_hash;
                block_number = block_number.or(receipt.block_number);
            }
        }

        Ok(Some(RichUserOperation {
            user_operation: record.op.into(),
            entry_point: self.entry_point.address(),
            block_number,
            block_hash,
            transaction_hash: record.transaction_hash,
        }))
    }

    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>> {
        if hash == H256::zero() {
            return Err(EthRpcError::InvalidParams("hash cannot be zero".to_string()))?;
        }
        let Some(record) = self
            .mempool
            .get_operation(hash)
            .await
            .map_err(EthRpcError::from)?
        else {
            return Ok(None);
        };
        let Some(tx_hash) = record.transaction_hash else {
            return Ok(None);
        };
        let Some(receipt) = self
            .entry_point
            .get_receipt(tx_hash)
            .await
            .map_err(EthRpcError::from)?
        else {
            return Ok(None);
        };

        let Some((event, logs)) = find_op_event(&receipt, hash) else {
            return Ok(None);
        };

        Ok(Some(UserOperationReceipt {
            user_op_hash: hash,
            entry_point: self.entry_point.address(),
            sender: record.op.sender,
            nonce: record.op.nonce,
            paymaster: record.op.paymaster(),
            actual_gas_cost: event.actual_gas_cost,
            actual_gas_used: event.actual_gas_used,
            success: event.success,
            reason: String::new(),
            logs,
            receipt,
        }))
    }

    async fn bundler_clear_mempool(&self) -> RpcResult<ClearMempoolResponse> {
        self.mempool.clear().await.map_err(EthRpcError::from)?;
        Ok(ClearMempoolResponse { cleared: true })
    }

    async fn bundler_get_status(&self) -> RpcResult<BundlerStatusResponse> {
        let size = self.mempool.size().await.map_err(EthRpcError::from)?;
        let status = self.bundler_status.read().clone();
        Ok(BundlerStatusResponse {
            is_running: status.is_running,
            mempool_size: size,
            last_bundle_id: status.last_bundle_id,
            last_bundle_time: status.last_bundle_time,
        })
    }
}

/// Locates the UserOperationEvent for the given op hash in a bundle receipt
/// and slices out the logs belonging to that operation: everything after the
/// previous operation's event up to and including its own.
fn find_op_event(
    receipt: &TransactionReceipt,
    op_hash: H256,
) -> Option<(UserOperationEventFilter, Vec<Log>)> {
    let signature = UserOperationEventFilter::signature();
    let event_index = receipt.logs.iter().position(|log| {
        log.topics.first() == Some(&signature) && log.topics.get(1) == Some(&op_hash)
    })?;
    let event = decode_op_event(&receipt.logs[event_index])?;

    let start = receipt.logs[..event_index]
        .iter()
        .rposition(|log| log.topics.first() == Some(&signature))
        .map(|previous| previous + 1)
        .unwrap_or(0);
    let logs = receipt.logs[start..=event_index].to_vec();
    Some((event, logs))
}

fn decode_op_event(log: &Log) -> Option<UserOperationEventFilter> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    UserOperationEventFilter::decode_log(&raw).ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use ethers::abi::{encode, Token};
    use ethers::types::{Bytes, U256};

    use super::*;
    use crate::{
        common::types::{UserOpRecord, UserOpStatus, UserOperation},
        entrypoint::{EntryPointError, MockEntryPointLike},
        mempool::{error::MempoolError, MockMempool},
    };

    const CHAIN_ID: u64 = 31337;

    fn entry_point_address() -> Address {
        "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
            .parse()
            .unwrap()
    }

    fn rpc_op(sender: Address, nonce: u64) -> RpcUserOperation {
        UserOperation {
            sender,
            nonce: nonce.into(),
            ..UserOperation::default()
        }
        .into()
    }

    fn api(mempool: MockMempool, entry_point: MockEntryPointLike) -> EthApi<MockMempool, MockEntryPointLike> {
        EthApi::new(
            CHAIN_ID,
            Arc::new(mempool),
            Arc::new(entry_point),
            SharedBundlerStatus::default(),
            Arc::new(RateLimiter::new(Duration::from_secs(1), 0)),
        )
    }

    fn addressed_entry_point() -> MockEntryPointLike {
        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_address()
            .returning(entry_point_address);
        entry_point
    }

    fn op_event_log(op_hash: H256, success: bool) -> Log {
        let data = encode(&[
            Token::Uint(U256::zero()),
            Token::Bool(success),
            Token::Uint(U256::from(1_000_000u64)),
            Token::Uint(U256::from(400_000u64)),
        ]);
        Log {
            address: entry_point_address(),
            topics: vec![
                UserOperationEventFilter::signature(),
                op_hash,
                H256::random(),
                H256::random(),
            ],
            data: Bytes::from(data),
            ..Log::default()
        }
    }

    fn plain_log() -> Log {
        Log {
            address: Address::random(),
            topics: vec![H256::random()],
            ..Log::default()
        }
    }

    #[tokio::test]
    async fn chain_id_is_hex_encoded() {
        let api = api(MockMempool::new(), addressed_entry_point());
        let chain_id = api.chain_id().await.unwrap();
        assert_eq!(serde_json::to_value(chain_id).unwrap(), "0x7a69");
    }

    #[tokio::test]
    async fn supported_entry_points_returns_configured_address() {
        let api = api(MockMempool::new(), addressed_entry_point());
        assert_eq!(
            api.supported_entry_points().await.unwrap(),
            vec![entry_point_address()]
        );
    }

    #[tokio::test]
    async fn send_rejects_unknown_entry_point() {
        let api = api(MockMempool::new(), addressed_entry_point());
        let result = api
            .send_user_operation(rpc_op(Address::random(), 0), Address::random())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_returns_hash_from_mempool() {
        let op = UserOperation {
            sender: Address::random(),
            ..UserOperation::default()
        };
        let hash = op.op_hash(entry_point_address(), CHAIN_ID);
        let record = UserOpRecord::new(op.clone(), hash, Utc::now());

        let mut mempool = MockMempool::new();
        {
            let record = record.clone();
            mempool
                .expect_add_operation()
                .returning(move |_| Ok(record.clone()));
        }
        let api = api(mempool, addressed_entry_point());

        let returned = api
            .send_user_operation(op.into(), entry_point_address())
            .await
            .unwrap();
        assert_eq!(returned, hash);
    }

    #[tokio::test]
    async fn send_surfaces_admission_errors() {
        let mut mempool = MockMempool::new();
        mempool
            .expect_add_operation()
            .returning(|_| Err(MempoolError::PoolFull(1000)));
        let api = api(mempool, addressed_entry_point());

        let error = api
            .send_user_operation(rpc_op(Address::random(), 0), entry_point_address())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("mempool"));
    }

    #[tokio::test]
    async fn rate_limited_send_is_rejected() {
        let mut entry_point = MockEntryPointLike::new();
        entry_point.expect_address().returning(entry_point_address);
        let api = EthApi::new(
            CHAIN_ID,
            Arc::new(MockMempool::new()),
            Arc::new(entry_point),
            SharedBundlerStatus::default(),
            Arc::new(RateLimiter::new(Duration::from_secs(60), 1)),
        );
        assert!(api.rate_limiter.try_acquire());
        let result = api
            .send_user_operation(rpc_op(Address::random(), 0), entry_point_address())
            .await;
        assert!(result.unwrap_err().to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn by_hash_returns_null_for_unknown_op() {
        let mut mempool = MockMempool::new();
        mempool.expect_get_operation().returning(|_| Ok(None));
        let api = api(mempool, addressed_entry_point());
        assert!(api
            .get_user_operation_by_hash(H256::random())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn by_hash_rejects_zero_hash() {
        let api = api(MockMempool::new(), addressed_entry_point());
        assert!(api.get_user_operation_by_hash(H256::zero()).await.is_err());
    }

    #[tokio::test]
    async fn by_hash_returns_pending_op_without_block_fields() {
        let op = UserOperation::default();
        let hash = H256::random();
        let record = UserOpRecord::new(op, hash, Utc::now());

        let mut mempool = MockMempool::new();
        mempool
            .expect_get_operation()
            .returning(move |_| Ok(Some(record.clone())));
        let api = api(mempool, addressed_entry_point());

        let rich = api.get_user_operation_by_hash(hash).await.unwrap().unwrap();
        assert_eq!(rich.entry_point, entry_point_address());
        assert!(rich.block_number.is_none());
        assert!(rich.block_hash.is_none());
        assert!(rich.transaction_hash.is_none());
    }

    #[tokio::test]
    async fn receipt_is_null_until_mined() {
        let op = UserOperation::default();
        let hash = H256::random();
        let record = UserOpRecord::new(op, hash, Utc::now());

        let mut mempool = MockMempool::new();
        mempool
            .expect_get_operation()
            .returning(move |_| Ok(Some(record.clone())));
        let api = api(mempool, addressed_entry_point());

        assert!(api
            .get_user_operation_receipt(hash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn receipt_decodes_user_operation_event() {
        let op = UserOperation {
            sender: Address::random(),
            ..UserOperation::default()
        };
        let hash = H256::random();
        let tx_hash = H256::random();
        let mut record = UserOpRecord::new(op.clone(), hash, Utc::now());
        record.status = UserOpStatus::Confirmed;
        record.transaction_hash = Some(tx_hash);
        record.block_number = Some(77);

        let other_op_hash = H256::random();
        let receipt = TransactionReceipt {
            status: Some(1.into()),
            block_number: Some(77.into()),
            logs: vec![
                plain_log(),
                op_event_log(other_op_hash, true),
                plain_log(),
                plain_log(),
                op_event_log(hash, true),
            ],
            ..TransactionReceipt::default()
        };

        let mut mempool = MockMempool::new();
        mempool
            .expect_get_operation()
            .returning(move |_| Ok(Some(record.clone())));
        let mut entry_point = addressed_entry_point();
        entry_point
            .expect_get_receipt()
            .returning(move |_| Ok(Some(receipt.clone())));
        let api = api(mempool, entry_point);

        let receipt = api
            .get_user_operation_receipt(hash)
            .await
            .unwrap()
            .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.sender, op.sender);
        assert_eq!(receipt.actual_gas_cost, 1_000_000.into());
        assert_eq!(receipt.actual_gas_used, 400_000.into());
        // The two plain logs plus this op's own event.
        assert_eq!(receipt.logs.len(), 3);
    }

    #[tokio::test]
    async fn estimate_surfaces_entry_point_failure() {
        let mut entry_point = addressed_entry_point();
        entry_point
            .expect_estimate_op_gas()
            .returning(|_| Err(EntryPointError::NoRevert));
        let api = api(MockMempool::new(), entry_point);

        let result = api
            .estimate_user_operation_gas(rpc_op(Address::random(), 0), entry_point_address())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clear_mempool_reports_cleared() {
        let mut mempool = MockMempool::new();
        mempool.expect_clear().returning(|| Ok(()));
        let api = api(mempool, addressed_entry_point());
        assert!(api.bundler_clear_mempool().await.unwrap().cleared);
    }

    #[tokio::test]
    async fn status_reports_mempool_size() {
        let mut mempool = MockMempool::new();
        mempool.expect_size().returning(|| Ok(42));
        let api = api(mempool, addressed_entry_point());
        let status = api.bundler_get_status().await.unwrap();
        assert_eq!(status.mempool_size, 42);
        assert!(!status.is_running);
    }

    #[test]
    fn find_op_event_slices_logs_for_first_op() {
        let hash = H256::random();
        let receipt = TransactionReceipt {
            logs: vec![plain_log(), op_event_log(hash, true), op_event_log(H256::random(), true)],
            ..TransactionReceipt::default()
        };
        let (event, logs) = find_op_event(&receipt, hash).unwrap();
        assert!(event.success);
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn find_op_event_missing_event_is_none() {
        let receipt = TransactionReceipt {
            logs: vec![plain_log()],
            ..TransactionReceipt::default()
        };
        assert!(find_op_event(&receipt, H256::random()).is_none());
    }
}
