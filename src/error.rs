//! Error types for the consensus set.

use std::io;
use thiserror::Error;

use crate::types::BlockId;

/// Main error type for consensus-set operations.
///
/// Only [`ConsensusError::InvalidBlock`] is recoverable: `fork_blockchain`
/// catches it, restores the pre-call state, and hands it back to the caller.
/// Every other variant is fatal to the call; the node should halt or enter
/// read-only mode rather than retry.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockRejection),

    #[error("cannot revert to a block outside the current path")]
    ExternalRevert,

    #[error("inconsistent consensus state: {0}")]
    Inconsistent(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("block {0} is not in the block tree")]
    UnknownBlock(BlockId),

    #[error("recovery after failed fork did not restore state: {0}")]
    Recovery(String),
}

impl ConsensusError {
    /// Whether the caller may continue using the consensus set after this
    /// error. Everything except a rejected block means the on-disk view can
    /// no longer be trusted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConsensusError::InvalidBlock(_))
    }
}

/// Reasons the diff generator rejects a block.
///
/// These surface as [`ConsensusError::InvalidBlock`] and are the only
/// non-fatal failures the engine produces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockRejection {
    #[error("transaction spends an unknown or already-spent output")]
    DoubleSpend,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("storage proof failed: {0}")]
    StorageProof(String),

    #[error("miner payouts do not match subsidy plus fees")]
    InvalidMinerPayout,

    #[error("siafund misuse: {0}")]
    SiafundMisuse(String),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("data not found: {0}")]
    NotFound(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Logging initialization errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Result with ConsensusError.
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for logging setup results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejected_blocks_are_recoverable() {
        assert!(ConsensusError::InvalidBlock(BlockRejection::DoubleSpend).is_recoverable());
        assert!(!ConsensusError::ExternalRevert.is_recoverable());
        assert!(!ConsensusError::Inconsistent("tip mismatch".into()).is_recoverable());
        assert!(!ConsensusError::Recovery("hash mismatch".into()).is_recoverable());
    }

    #[test]
    fn rejection_converts_into_consensus_error() {
        let err: ConsensusError = BlockRejection::InvalidMinerPayout.into();
        assert!(matches!(err, ConsensusError::InvalidBlock(_)));
    }
}
