//! ABI surface of the ERC-4337 EntryPoint contract, expressed as typed call
//! encoders and revert/event decoders rather than full generated bindings.

use ethers::{
    abi::AbiEncode,
    contract::{EthAbiCodec, EthAbiType, EthError, EthEvent},
    types::{Address, Bytes, Selector, H256, U256},
    utils::id,
};

use crate::common::types::UserOperation;

const USER_OPERATION_TUPLE: &str =
    "(address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)";

pub fn handle_ops_selector() -> Selector {
    id(format!("handleOps({USER_OPERATION_TUPLE}[],address)"))
}

pub fn simulate_validation_selector() -> Selector {
    id(format!("simulateValidation({USER_OPERATION_TUPLE})"))
}

pub fn get_sender_address_selector() -> Selector {
    id("getSenderAddress(bytes)")
}

pub fn get_deposit_info_selector() -> Selector {
    id("getDepositInfo(address)")
}

pub fn balance_of_selector() -> Selector {
    id("balanceOf(address)")
}

pub fn add_stake_selector() -> Selector {
    id("addStake(uint32)")
}

pub fn unlock_stake_selector() -> Selector {
    id("unlockStake()")
}

pub fn withdraw_stake_selector() -> Selector {
    id("withdrawStake(address)")
}

pub fn withdraw_to_selector() -> Selector {
    id("withdrawTo(address,uint256)")
}

/// Creates call data from a method selector and its arguments. The arguments
/// should be passed as a tuple.
///
/// Important: if the method takes a single argument, then this function should
/// be passed a single-element tuple, and not just the argument by itself.
pub fn call_data_of(selector: Selector, args: impl AbiEncode) -> Bytes {
    let mut bytes = selector.to_vec();
    bytes.extend(args.encode());
    bytes.into()
}

/// Successful simulateValidation outcome, delivered as a revert.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(
    name = "ValidationResult",
    abi = "ValidationResult(uint256,uint256,uint256,uint256,bytes)"
)]
pub struct ValidationResult {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub valid_after: U256,
    pub valid_until: U256,
    pub signature_failed: Bytes,
}

/// Validation rejection for the op at the given index within a bundle.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "FailedOp", abi = "FailedOp(uint256,string)")]
pub struct FailedOp {
    pub op_index: U256,
    pub reason: String,
}

/// Counterfactual sender address, delivered as a revert from getSenderAddress.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "SenderAddressResult", abi = "SenderAddressResult(address)")]
pub struct SenderAddressResult {
    pub sender: Address,
}

/// This is the abi for what happens when you just revert("message") in a contract
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "Error", abi = "Error(string)")]
pub struct ContractRevertError {
    pub reason: String,
}

/// Return value of getDepositInfo.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthAbiType, EthAbiCodec)]
pub struct DepositInfo {
    pub deposit: U256,
    pub staked: bool,
    pub stake: U256,
    pub unstake_delay_sec: u32,
    pub withdraw_time: U256,
}

/// Emitted by the EntryPoint once per executed user operation.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthEvent)]
#[ethevent(
    name = "UserOperationEvent",
    abi = "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)"
)]
pub struct UserOperationEventFilter {
    #[ethevent(indexed)]
    pub user_op_hash: H256,
    #[ethevent(indexed)]
    pub sender: Address,
    #[ethevent(indexed)]
    pub paymaster: Address,
    pub nonce: U256,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
}

/// Encodes a handleOps call for the given operations and beneficiary.
pub fn handle_ops_call_data(ops: Vec<UserOperation>, beneficiary: Address) -> Bytes {
    call_data_of(handle_ops_selector(), (ops, beneficiary))
}

#[cfg(test)]
mod tests {
    use ethers::abi::AbiDecode;

    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(handle_ops_selector(), [0x1f, 0xad, 0x94, 0x8c]);
        assert_eq!(simulate_validation_selector(), [0xee, 0x21, 0x94, 0x23]);
        assert_eq!(balance_of_selector(), [0x70, 0xa0, 0x82, 0x31]);
    }

    #[test]
    fn test_handle_ops_call_data_layout() {
        let beneficiary: Address = "0x0102030405060708090a0b0c0d0e0f1011121314"
            .parse()
            .unwrap();
        let data = handle_ops_call_data(vec![UserOperation::default()], beneficiary);
        assert_eq!(data[..4], handle_ops_selector()[..]);
        // Beneficiary is the second static argument, right-aligned in word 2.
        assert_eq!(&data[4 + 32 + 12..4 + 64], beneficiary.as_bytes());
    }

    #[test]
    fn test_validation_result_decode() {
        let payload = call_data_of(
            id("ValidationResult(uint256,uint256,uint256,uint256,bytes)"),
            (
                U256::from(50_000),
                U256::from(1_000_000_000_000_000_u64),
                U256::zero(),
                U256::from(u64::MAX),
                Bytes::default(),
            ),
        );
        let decoded = ValidationResult::decode(&payload).unwrap();
        assert_eq!(decoded.pre_op_gas, 50_000.into());
        assert_eq!(decoded.prefund, 1_000_000_000_000_000_u64.into());
        assert_eq!(decoded.valid_until, u64::MAX.into());
    }

    #[test]
    fn test_failed_op_decode() {
        let payload = call_data_of(
            id("FailedOp(uint256,string)"),
            (U256::zero(), "AA21 didn't pay prefund".to_string()),
        );
        let decoded = FailedOp::decode(&payload).unwrap();
        assert_eq!(decoded.reason, "AA21 didn't pay prefund");
        // A FailedOp payload is not a ValidationResult.
        assert!(ValidationResult::decode(&payload).is_err());
    }

    #[test]
    fn test_sender_address_result_decode() {
        let sender: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
            .parse()
            .unwrap();
        let payload = call_data_of(id("SenderAddressResult(address)"), (sender,));
        assert_eq!(
            SenderAddressResult::decode(&payload).unwrap().sender,
            sender
        );
    }
}
