use jsonrpsee::{
    core::Error as RpcError,
    types::{
        error::{CallError, INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
        ErrorObject,
    },
};

use crate::{entrypoint::EntryPointError, mempool::error::MempoolError};

// Error codes borrowed from jsonrpsee
// PARSE_ERROR_CODE = -32700
// INVALID_REQUEST_CODE = -32600
// METHOD_NOT_FOUND_CODE = -32601
// INVALID_PARAMS_CODE = -32602
// INTERNAL_ERROR_CODE = -32603

// Custom bundler error codes
const INVALID_USER_OP_CODE: i32 = -32000;
const UNSUPPORTED_OPERATION_CODE: i32 = -32001;
const GAS_TOO_LOW_CODE: i32 = -32002;
const PAYMASTER_DEPLETED_CODE: i32 = -32003;
const RATE_LIMITED_CODE: i32 = -32004;
const UNAUTHORIZED_CODE: i32 = -32005;
const INSUFFICIENT_FUNDS_CODE: i32 = -32006;
const ENTRYPOINT_ERROR_CODE: i32 = -32007;

/// Error returned by the RPC server eth namespace
#[derive(Debug, thiserror::Error)]
pub enum EthRpcError {
    /// Invalid parameters
    #[error("{0}")]
    InvalidParams(String),
    /// The operation was rejected at admission or validation
    #[error("{0}")]
    InvalidUserOp(String),
    /// Method exists but the requested variant is not supported
    #[error("{0}")]
    UnsupportedOperation(String),
    /// An operation gas field is below what execution requires
    #[error("{0}")]
    GasTooLow(String),
    /// The sponsoring paymaster cannot cover the operation
    #[error("{0}")]
    PaymasterDepleted(String),
    /// Ingress throttling kicked in
    #[error("rate limited, retry later")]
    RateLimited,
    /// Caller is not allowed to use this method
    #[error("unauthorized")]
    Unauthorized,
    /// The sender account cannot prefund the operation
    #[error("{0}")]
    InsufficientFunds(String),
    /// The EntryPoint misbehaved or is misconfigured
    #[error("{0}")]
    EntryPointError(String),
    /// Other internal errors
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<MempoolError> for EthRpcError {
    fn from(error: MempoolError) -> Self {
        match error {
            MempoolError::PoolFull(_)
            | MempoolError::ReplacementUnderpriced(_, _)
            | MempoolError::SignatureCheckFailed => EthRpcError::InvalidUserOp(error.to_string()),
            MempoolError::EntryPoint(inner) => inner.into(),
            MempoolError::Other(inner) => EthRpcError::Internal(inner),
        }
    }
}

impl From<EntryPointError> for EthRpcError {
    fn from(error: EntryPointError) -> Self {
        match error {
            EntryPointError::ValidationRejected(reason) => {
                // The EntryPoint's AA-prefixed reason codes distinguish
                // account funding and paymaster deposit failures.
                if reason.starts_with("AA21") {
                    EthRpcError::InsufficientFunds(reason)
                } else if reason.starts_with("AA31") {
                    EthRpcError::PaymasterDepleted(reason)
                } else {
                    EthRpcError::InvalidUserOp(reason)
                }
            }
            EntryPointError::NoRevert | EntryPointError::UndecodableRevert => {
                EthRpcError::EntryPointError(error.to_string())
            }
            EntryPointError::Other(inner) => EthRpcError::Internal(inner),
        }
    }
}

impl From<EthRpcError> for RpcError {
    fn from(error: EthRpcError) -> Self {
        let msg = error.to_string();

        match error {
            EthRpcError::InvalidParams(_) => rpc_err(INVALID_PARAMS_CODE, msg),
            EthRpcError::InvalidUserOp(_) => rpc_err(INVALID_USER_OP_CODE, msg),
            EthRpcError::UnsupportedOperation(_) => rpc_err(UNSUPPORTED_OPERATION_CODE, msg),
            EthRpcError::GasTooLow(_) => rpc_err(GAS_TOO_LOW_CODE, msg),
            EthRpcError::PaymasterDepleted(_) => rpc_err(PAYMASTER_DEPLETED_CODE, msg),
            EthRpcError::RateLimited => rpc_err(RATE_LIMITED_CODE, msg),
            EthRpcError::Unauthorized => rpc_err(UNAUTHORIZED_CODE, msg),
            EthRpcError::InsufficientFunds(_) => rpc_err(INSUFFICIENT_FUNDS_CODE, msg),
            EthRpcError::EntryPointError(_) => rpc_err(ENTRYPOINT_ERROR_CODE, msg),
            EthRpcError::Internal(_) => rpc_err(INTERNAL_ERROR_CODE, msg),
        }
    }
}

fn rpc_err(code: i32, msg: impl Into<String>) -> RpcError {
    RpcError::Call(CallError::Custom(ErrorObject::owned(
        code,
        msg.into(),
        None::<()>,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_of(error: EthRpcError) -> i32 {
        match RpcError::from(error) {
            RpcError::Call(CallError::Custom(object)) => object.code(),
            other => panic!("expected custom call error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            code_of(EthRpcError::InvalidParams("bad entry point".into())),
            -32602
        );
        assert_eq!(
            code_of(EthRpcError::InvalidUserOp("mempool is full".into())),
            -32000
        );
        assert_eq!(
            code_of(EthRpcError::UnsupportedOperation("no".into())),
            -32001
        );
        assert_eq!(code_of(EthRpcError::GasTooLow("low".into())), -32002);
        assert_eq!(
            code_of(EthRpcError::PaymasterDepleted("AA31".into())),
            -32003
        );
        assert_eq!(code_of(EthRpcError::RateLimited), -32004);
        assert_eq!(code_of(EthRpcError::Unauthorized), -32005);
        assert_eq!(
            code_of(EthRpcError::InsufficientFunds("AA21".into())),
            -32006
        );
        assert_eq!(
            code_of(EthRpcError::EntryPointError("no revert".into())),
            -32007
        );
        assert_eq!(
            code_of(EthRpcError::Internal(anyhow::anyhow!("boom"))),
            -32603
        );
    }

    #[test]
    fn test_mempool_error_maps_to_invalid_user_op() {
        assert_eq!(code_of(MempoolError::PoolFull(1000).into()), -32000);
        assert_eq!(
            code_of(MempoolError::ReplacementUnderpriced(1.into(), 2.into()).into()),
            -32000
        );
        assert_eq!(code_of(MempoolError::SignatureCheckFailed.into()), -32000);
    }

    #[test]
    fn test_pool_full_message_mentions_mempool() {
        let error: EthRpcError = MempoolError::PoolFull(1000).into();
        assert!(error.to_string().contains("mempool"));
    }

    #[test]
    fn test_validation_reason_routing() {
        let depleted: EthRpcError =
            EntryPointError::ValidationRejected("AA31 paymaster deposit too low".into()).into();
        assert_eq!(code_of(depleted), -32003);

        let no_funds: EthRpcError =
            EntryPointError::ValidationRejected("AA21 didn't pay prefund".into()).into();
        assert_eq!(code_of(no_funds), -32006);

        let generic: EthRpcError =
            EntryPointError::ValidationRejected("AA25 invalid account nonce".into()).into();
        assert_eq!(code_of(generic), -32000);

        let misconfigured: EthRpcError = EntryPointError::NoRevert.into();
        assert_eq!(code_of(misconfigured), -32007);
    }
}
