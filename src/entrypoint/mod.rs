//! Typed port over the on-chain EntryPoint contract. All EVM-RPC interaction
//! for validation, gas estimation, and bundle submission happens here.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use ethers::{
    abi::AbiDecode,
    providers::{JsonRpcError, Middleware, MiddlewareError},
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest, H256,
        TransactionReceipt, U256,
    },
};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::common::{
    contracts::{
        add_stake_selector, balance_of_selector, call_data_of, get_deposit_info_selector,
        get_sender_address_selector, handle_ops_call_data, simulate_validation_selector,
        unlock_stake_selector, withdraw_stake_selector, withdraw_to_selector,
        ContractRevertError, DepositInfo, FailedOp, SenderAddressResult, ValidationResult,
    },
    gas::GasFees,
    math,
    types::UserOperation,
};

/// How often to poll for a submitted transaction's receipt.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// EntryPoint result type.
pub type EntryPointResult<T> = std::result::Result<T, EntryPointError>;

/// EntryPoint error type.
#[derive(Debug, thiserror::Error)]
pub enum EntryPointError {
    /// The EntryPoint rejected the operation during simulation.
    #[error("validation failed: {0}")]
    ValidationRejected(String),
    /// A simulate/getSender call completed without reverting, which means the
    /// configured address is not an EntryPoint.
    #[error("entry point call did not revert; misconfigured entry point address?")]
    NoRevert,
    /// The call reverted but the payload matched no known shape.
    #[error("could not decode entry point revert data")]
    UndecodableRevert,
    /// Some other error occurred
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a successful simulateValidation revert.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValidationOutput {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub valid_after: U256,
    pub valid_until: U256,
    pub signature_failed: bool,
}

/// Gas and fee estimate for a user operation, returned verbatim on the RPC
/// surface as 0x-prefixed hex quantities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Transaction parameters applied to a handleOps submission.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransactionOverrides {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub gas_limit: U256,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntryPointLike: Send + Sync + 'static {
    fn address(&self) -> Address;

    /// Runs the EntryPoint's validation simulation for the operation. The
    /// contract reports success by reverting with a ValidationResult payload;
    /// any other outcome is an error.
    async fn simulate_validation(&self, op: UserOperation) -> EntryPointResult<ValidationOutput>;

    /// Estimates the gas fields a client should use for the operation.
    async fn estimate_op_gas(&self, op: UserOperation) -> EntryPointResult<GasEstimate>;

    /// Submits a handleOps transaction and returns its hash.
    async fn handle_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
        overrides: TransactionOverrides,
    ) -> EntryPointResult<H256>;

    /// Polls for the receipt of a submitted transaction until the timeout
    /// elapses. A None return means the transaction is still unmined.
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> EntryPointResult<Option<TransactionReceipt>>;

    async fn get_receipt(&self, tx_hash: H256) -> EntryPointResult<Option<TransactionReceipt>>;

    /// Counterfactual sender address for the given init code, recovered from
    /// the getSenderAddress revert payload.
    async fn get_sender_address(&self, init_code: Bytes) -> EntryPointResult<Address>;

    async fn get_deposit_info(&self, account: Address) -> EntryPointResult<DepositInfo>;

    async fn balance_of(&self, account: Address) -> EntryPointResult<U256>;

    /// Native balance of an arbitrary account, used for signer health checks.
    async fn get_balance(&self, account: Address) -> EntryPointResult<U256>;

    /// Current chain fee estimates.
    async fn fee_data(&self) -> EntryPointResult<GasFees>;

    async fn add_stake(&self, unstake_delay_sec: u32, value: U256) -> EntryPointResult<H256>;

    async fn unlock_stake(&self) -> EntryPointResult<H256>;

    async fn withdraw_stake(&self, withdraw_address: Address) -> EntryPointResult<H256>;

    async fn withdraw_to(&self, withdraw_address: Address, amount: U256)
        -> EntryPointResult<H256>;
}

/// Concrete adapter over an ethers middleware stack. The middleware is
/// expected to carry the bundler signer for the submission methods.
#[derive(Debug)]
pub struct EntryPoint<M: Middleware> {
    address: Address,
    client: Arc<M>,
}

impl<M: Middleware + 'static> EntryPoint<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self { address, client }
    }

    fn call_tx(&self, data: Bytes) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .to(self.address)
            .data(data)
            .into()
    }

    async fn send(&self, tx: Eip1559TransactionRequest) -> EntryPointResult<H256> {
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .context("should send entry point transaction")?;
        Ok(pending.tx_hash())
    }
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointLike for EntryPoint<M> {
    fn address(&self) -> Address {
        self.address
    }

    async fn simulate_validation(&self, op: UserOperation) -> EntryPointResult<ValidationOutput> {
        let data = call_data_of(simulate_validation_selector(), (op,));
        let error = match self.client.call(&self.call_tx(data), None).await {
            Ok(_) => return Err(EntryPointError::NoRevert),
            Err(error) => error,
        };
        if let Some(result) = middleware_revert::<ValidationResult, _>(&error) {
            return Ok(ValidationOutput {
                pre_op_gas: result.pre_op_gas,
                prefund: result.prefund,
                valid_after: result.valid_after,
                valid_until: result.valid_until,
                signature_failed: !result.signature_failed.is_empty(),
            });
        }
        if let Some(failed) = middleware_revert::<FailedOp, _>(&error) {
            return Err(EntryPointError::ValidationRejected(failed.reason));
        }
        if let Some(revert) = middleware_revert::<ContractRevertError, _>(&error) {
            return Err(EntryPointError::ValidationRejected(revert.reason));
        }
        if is_middleware_revert(&error) {
            return Err(EntryPointError::UndecodableRevert);
        }
        Err(anyhow::Error::new(error)
            .context("simulateValidation call failed")
            .into())
    }

    async fn estimate_op_gas(&self, op: UserOperation) -> EntryPointResult<GasEstimate> {
        let validation = self.simulate_validation(op.clone()).await?;
        let fees = self.fee_data().await?;
        Ok(build_gas_estimate(&op, validation.pre_op_gas, fees))
    }

    async fn handle_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
        overrides: TransactionOverrides,
    ) -> EntryPointResult<H256> {
        let tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(handle_ops_call_data(ops, beneficiary))
            .max_fee_per_gas(overrides.max_fee_per_gas)
            .max_priority_fee_per_gas(overrides.max_priority_fee_per_gas)
            .gas(overrides.gas_limit);
        self.send(tx).await
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> EntryPointResult<Option<TransactionReceipt>> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(receipt) = self.get_receipt(tx_hash).await? {
                return Ok(Some(receipt));
            }
            if time::Instant::now() >= deadline {
                return Ok(None);
            }
            time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> EntryPointResult<Option<TransactionReceipt>> {
        Ok(self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .context("should get transaction receipt")?)
    }

    async fn get_sender_address(&self, init_code: Bytes) -> EntryPointResult<Address> {
        let data = call_data_of(get_sender_address_selector(), (init_code,));
        let error = match self.client.call(&self.call_tx(data), None).await {
            Ok(_) => return Err(EntryPointError::NoRevert),
            Err(error) => error,
        };
        if let Some(result) = middleware_revert::<SenderAddressResult, _>(&error) {
            return Ok(result.sender);
        }
        if is_middleware_revert(&error) {
            return Err(EntryPointError::UndecodableRevert);
        }
        Err(anyhow::Error::new(error)
            .context("getSenderAddress call failed")
            .into())
    }

    async fn get_deposit_info(&self, account: Address) -> EntryPointResult<DepositInfo> {
        let data = call_data_of(get_deposit_info_selector(), (account,));
        let returned = self
            .client
            .call(&self.call_tx(data), None)
            .await
            .map_err(|error| anyhow::Error::new(error).context("getDepositInfo call failed"))?;
        Ok(DepositInfo::decode(&returned).context("should decode deposit info")?)
    }

    async fn balance_of(&self, account: Address) -> EntryPointResult<U256> {
        let data = call_data_of(balance_of_selector(), (account,));
        let returned = self
            .client
            .call(&self.call_tx(data), None)
            .await
            .map_err(|error| anyhow::Error::new(error).context("balanceOf call failed"))?;
        Ok(U256::decode(&returned).context("should decode balance")?)
    }

    async fn get_balance(&self, account: Address) -> EntryPointResult<U256> {
        Ok(self
            .client
            .get_balance(account, None)
            .await
            .context("should get account balance")?)
    }

    async fn fee_data(&self) -> EntryPointResult<GasFees> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .context("should estimate chain fees")?;
        Ok(GasFees::new(max_fee_per_gas, max_priority_fee_per_gas))
    }

    async fn add_stake(&self, unstake_delay_sec: u32, value: U256) -> EntryPointResult<H256> {
        let tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(call_data_of(add_stake_selector(), (unstake_delay_sec,)))
            .value(value);
        self.send(tx).await
    }

    async fn unlock_stake(&self) -> EntryPointResult<H256> {
        let tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(Bytes::from(unlock_stake_selector().to_vec()));
        self.send(tx).await
    }

    async fn withdraw_stake(&self, withdraw_address: Address) -> EntryPointResult<H256> {
        let tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(call_data_of(withdraw_stake_selector(), (withdraw_address,)));
        self.send(tx).await
    }

    async fn withdraw_to(
        &self,
        withdraw_address: Address,
        amount: U256,
    ) -> EntryPointResult<H256> {
        let tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(call_data_of(withdraw_to_selector(), (withdraw_address, amount)));
        self.send(tx).await
    }
}

/// Applies the estimation rules to an operation given its simulated
/// pre-operation gas and the chain's current fees.
fn build_gas_estimate(op: &UserOperation, pre_op_gas: U256, fees: GasFees) -> GasEstimate {
    GasEstimate {
        pre_verification_gas: pre_op_gas,
        verification_gas_limit: math::ratio(op.verification_gas_limit, 3, 2),
        call_gas_limit: math::ratio(op.call_gas_limit, 11, 10),
        max_fee_per_gas: math::increase_by_percent(fees.max_fee_per_gas, 10),
        max_priority_fee_per_gas: math::increase_by_percent(fees.max_priority_fee_per_gas, 10),
    }
}

/// Decodes a typed revert payload out of a JSON-RPC error response, if the
/// response is a revert carrying one.
fn decode_revert<D: AbiDecode>(response: &JsonRpcError) -> Option<D> {
    if !response.is_revert() {
        return None;
    }
    response.decode_revert_data()
}

/// Like `decode_revert`, digging the JSON-RPC response out of a middleware
/// error first.
fn middleware_revert<D: AbiDecode, E: MiddlewareError>(error: &E) -> Option<D> {
    error.as_error_response().and_then(|r| decode_revert(r))
}

fn is_middleware_revert<E: MiddlewareError>(error: &E) -> bool {
    error
        .as_error_response()
        .map(JsonRpcError::is_revert)
        .unwrap_or(false)
}
