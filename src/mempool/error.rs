use ethers::types::U256;

use crate::entrypoint::EntryPointError;

/// Mempool result type.
pub type MempoolResult<T> = std::result::Result<T, MempoolError>;

/// Mempool error type.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// Some other error occurred
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    /// Validation rejected the operation, surfaced from the EntryPoint.
    #[error(transparent)]
    EntryPoint(#[from] EntryPointError),
    /// Operation with same sender/nonce already in pool
    /// and the replacement operation has lower gas price.
    #[error("replacement operation underpriced; existing priority fee: {0}, existing fee: {1}")]
    ReplacementUnderpriced(U256, U256),
    /// The mempool has reached its configured capacity.
    #[error("mempool is full (capacity {0})")]
    PoolFull(usize),
    /// The EntryPoint reported a signature failure during simulation.
    #[error("invalid UserOp signature or paymaster signature")]
    SignatureCheckFailed,
}
