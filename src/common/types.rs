use chrono::{DateTime, Utc};
use ethers::{
    abi::{encode, Token},
    contract::EthAbiType,
    types::{Address, Bytes, H256, U256},
    utils::keccak256,
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use strum::EnumString;
use uuid::Uuid;

/// A signed intent to execute a contract call from a smart-contract account,
/// as defined by ERC-4337 v0.6.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthAbiType, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Unique identifier for a user operation from a given sender
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserOperationId {
    pub sender: Address,
    pub nonce: U256,
}

impl UserOperation {
    /// Get the unique identifier for this user operation from its sender
    pub fn id(&self) -> UserOperationId {
        UserOperationId {
            sender: self.sender,
            nonce: self.nonce,
        }
    }

    pub fn factory(&self) -> Option<Address> {
        Self::get_address_from_field(&self.init_code)
    }

    pub fn paymaster(&self) -> Option<Address> {
        Self::get_address_from_field(&self.paymaster_and_data)
    }

    /// Extracts an address from the beginning of a data field
    /// Useful to extract the paymaster address from paymaster_and_data
    /// and the factory address from init_code
    pub fn get_address_from_field(data: &Bytes) -> Option<Address> {
        if data.len() < 20 {
            None
        } else {
            Some(Address::from_slice(&data[..20]))
        }
    }

    /// Canonical EIP-4337 hash of this user operation. Pure function of the
    /// operation fields, the entry point address, and the chain id, so every
    /// node derives the same identity for the same payload.
    pub fn op_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        keccak256(encode(&[
            Token::FixedBytes(keccak256(self.pack_for_hash()).to_vec()),
            Token::Address(entry_point),
            Token::Uint(chain_id.into()),
        ]))
        .into()
    }

    /// ABI-encodes the operation with its variable-length fields hashed and
    /// the signature omitted, per the EntryPoint's getUserOpHash.
    fn pack_for_hash(&self) -> Bytes {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
        .into()
    }
}

/// Lifecycle state of a user operation. Monotonic except that a pending
/// operation may move straight to removed on replacement or explicit removal.
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq, EnumString, Serialize, Deserialize)]
#[display(style = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserOpStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Removed,
}

/// Lifecycle state of a bundle. Confirmed and failed are terminal.
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq, EnumString, Serialize, Deserialize)]
#[display(style = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// A user operation together with its durable bookkeeping fields.
#[derive(Clone, Debug, PartialEq)]
pub struct UserOpRecord {
    pub op: UserOperation,
    pub hash: H256,
    pub status: UserOpStatus,
    pub bundle_id: Option<Uuid>,
    pub transaction_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl UserOpRecord {
    pub fn new(op: UserOperation, hash: H256, submitted_at: DateTime<Utc>) -> Self {
        Self {
            op,
            hash,
            status: UserOpStatus::Pending,
            bundle_id: None,
            transaction_hash: None,
            block_number: None,
            error: None,
            submitted_at,
        }
    }
}

/// A set of user operations submitted in one EntryPoint handleOps transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleRecord {
    pub id: Uuid,
    pub status: BundleStatus,
    pub transaction_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl BundleRecord {
    pub fn new(id: Uuid, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: BundleStatus::Pending,
            transaction_hash: None,
            block_number: None,
            error: None,
            submitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_address_from_field() {
        let paymaster_and_data: Bytes =
            "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                .parse()
                .unwrap();
        let address = UserOperation::get_address_from_field(&paymaster_and_data).unwrap();
        assert_eq!(
            address,
            "0x0123456789abcdef0123456789abcdef01234567"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn test_no_address_in_short_field() {
        let init_code: Bytes = "0x0123456789".parse().unwrap();
        assert_eq!(UserOperation::get_address_from_field(&init_code), None);
    }

    // Hashes computed against the v0.6 EntryPoint at
    // 0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789 on chain 80001.
    #[test]
    fn test_op_hash() {
        let entry_point: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
            .parse()
            .unwrap();
        let op = UserOperation {
            verification_gas_limit: 100_000.into(),
            pre_verification_gas: 21_000.into(),
            max_priority_fee_per_gas: 1_000_000_000.into(),
            ..UserOperation::default()
        };
        assert_eq!(
            op.op_hash(entry_point, 80_001),
            "0x95418c07086df02ff6bc9e8bdc150b380cb761beecc098630440bcec6e862702"
                .parse::<H256>()
                .unwrap()
        );

        let op = UserOperation {
            sender: "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap(),
            nonce: U256::zero(),
            init_code: "0x9406cc6185a346906296840746125a0e449764545fbfb9cf000000000000000000000000ce0fefa6f7979c4c9b5373e0f5105b7259092c6d0000000000000000000000000000000000000000000000000000000000000000".parse().unwrap(),
            call_data: "0xb61d27f60000000000000000000000009c5754de1443984659e1b3a8d1931d83475ba29c00000000000000000000000000000000000000000000000000005af3107a400000000000000000000000000000000000000000000000000000000000000000600000000000000000000000000000000000000000000000000000000000000000".parse().unwrap(),
            call_gas_limit: 33_100.into(),
            verification_gas_limit: 361_460.into(),
            pre_verification_gas: 44_980.into(),
            max_fee_per_gas: 1_695_000_030_u64.into(),
            max_priority_fee_per_gas: 1_695_000_000.into(),
            paymaster_and_data: Bytes::default(),
            signature: "0xebfd4657afe1f1c05c1ec65f3f9cc992a3ac083c424454ba61eab93152195e1400d74df01fc9fa53caadcb83a891d478b713016bcc0c64307c1ad3d7ea2e2d921b".parse().unwrap(),
        };
        assert_eq!(
            op.op_hash(entry_point, 80_001),
            "0x7c1b8c9df49a9e09ecef0f0fe6841d895850d29820f9a4b494097764085dcd7e"
                .parse::<H256>()
                .unwrap()
        );
    }

    #[test]
    fn test_hash_ignores_signature() {
        let entry_point = Address::zero();
        let op = UserOperation {
            sender: "0x0123456789abcdef0123456789abcdef01234567".parse().unwrap(),
            nonce: 7.into(),
            ..UserOperation::default()
        };
        let mut signed = op.clone();
        signed.signature = "0xdeadbeef".parse().unwrap();
        assert_eq!(op.op_hash(entry_point, 1), signed.op_hash(entry_point, 1));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            UserOpStatus::Pending,
            UserOpStatus::Submitted,
            UserOpStatus::Confirmed,
            UserOpStatus::Failed,
            UserOpStatus::Removed,
        ] {
            assert_eq!(status.to_string().parse::<UserOpStatus>().unwrap(), status);
        }
    }
}
