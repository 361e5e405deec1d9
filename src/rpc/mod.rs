//! JSON-RPC surface: the standard EIP-4337 eth namespace, bundler admin
//! methods, and the operator health endpoints.

mod error;
mod eth;
mod health;
mod metrics;
mod task;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256, U64};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::EthRpcError;
pub use eth::{EthApi, EthApiServer};
pub use health::{HealthChecker, SystemApiServer};
pub use task::{Args, RpcTask};

use crate::common::types::UserOperation;

/// User operation definition for RPC. Numeric fields accept either decimal
/// strings or 0x-prefixed hex on the way in; responses are always hex.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    sender: Address,
    #[serde(deserialize_with = "quantity::deserialize")]
    nonce: U256,
    init_code: Bytes,
    call_data: Bytes,
    #[serde(deserialize_with = "quantity::deserialize")]
    call_gas_limit: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    verification_gas_limit: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    pre_verification_gas: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    max_fee_per_gas: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    max_priority_fee_per_gas: U256,
    paymaster_and_data: Bytes,
    signature: Bytes,
}

impl From<UserOperation> for RpcUserOperation {
    fn from(op: UserOperation) -> Self {
        RpcUserOperation {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.init_code,
            call_data: op.call_data,
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster_and_data: op.paymaster_and_data,
            signature: op.signature,
        }
    }
}

impl From<RpcUserOperation> for UserOperation {
    fn from(def: RpcUserOperation) -> Self {
        UserOperation {
            sender: def.sender,
            nonce: def.nonce,
            init_code: def.init_code,
            call_data: def.call_data,
            call_gas_limit: def.call_gas_limit,
            verification_gas_limit: def.verification_gas_limit,
            pre_verification_gas: def.pre_verification_gas,
            max_fee_per_gas: def.max_fee_per_gas,
            max_priority_fee_per_gas: def.max_priority_fee_per_gas,
            paymaster_and_data: def.paymaster_and_data,
            signature: def.signature,
        }
    }
}

/// User operation with inclusion metadata, as returned by
/// eth_getUserOperationByHash. The block fields are null until the operation
/// is mined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RichUserOperation {
    pub user_operation: RpcUserOperation,
    pub entry_point: Address,
    pub block_number: Option<U64>,
    pub block_hash: Option<H256>,
    pub transaction_hash: Option<H256>,
}

/// User operation receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub entry_point: Address,
    pub sender: Address,
    pub nonce: U256,
    pub paymaster: Option<Address>,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub success: bool,
    pub reason: String,
    pub logs: Vec<Log>,
    pub receipt: TransactionReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearMempoolResponse {
    pub cleared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlerStatusResponse {
    pub is_running: bool,
    pub mempool_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_bundle_time: Option<DateTime<Utc>>,
}

/// Fixed-window ingress throttle applied to the state-mutating methods.
/// A zero request budget disables it.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn try_acquire(&self) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.0) >= self.window {
            *state = (now, 0);
        }
        if state.1 >= self.max_requests {
            return false;
        }
        state.1 += 1;
        true
    }
}

mod quantity {
    use ethers::types::U256;
    use serde::de::{Deserializer, Error, Visitor};

    /// Accepts "0x"-prefixed hex strings, decimal strings, and JSON numbers.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct QuantityVisitor;

        impl<'de> Visitor<'de> for QuantityVisitor {
            type Value = U256;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a hex quantity, decimal string, or number")
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<U256, E> {
                if let Some(hex) = value.strip_prefix("0x") {
                    U256::from_str_radix(hex, 16)
                        .map_err(|_| E::custom(format!("invalid hex quantity: {value}")))
                } else {
                    U256::from_dec_str(value)
                        .map_err(|_| E::custom(format!("invalid decimal quantity: {value}")))
                }
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<U256, E> {
                Ok(U256::from(value))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}
