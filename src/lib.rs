//! Proof-of-work consensus set with an atomic fork/reorganization engine.
//!
//! This library maintains a persistent block tree, a canonical current path,
//! and the live consensus state (siacoin outputs, file contracts, siafund
//! outputs, delayed outputs, and the siafund pool). Its central operation is
//! [`ConsensusSet::fork_blockchain`]: told a target tip, it reverts the
//! current path back to the common parent and applies the target branch,
//! block by block, under an atomicity contract — either the fork completes
//! or the pre-call state is restored bit for bit.
//!
//! Blocks enter the tree through [`ConsensusSet::link_block`] once an
//! external validator has checked their headers. The first time a block is
//! applied, its state diffs are generated by the configured rule set and
//! stored on the block record; later applications (and all reverts) replay
//! the stored diffs.
//!
//! # Quick Start
//!
//! ```no_run
//! use consensus_set::{ConsensusSet, EngineConfig, StandardRules};
//! use consensus_set::store::RocksChainStore;
//! use consensus_set::types::{Block, BlockId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RocksChainStore::open("./.tmp/consensus").await?;
//!     let genesis = Block {
//!         parent_id: BlockId([0u8; 32]),
//!         nonce: 0,
//!         timestamp: 0,
//!         miner_payouts: Vec::new(),
//!         transactions: Vec::new(),
//!     };
//!     let mut cs = ConsensusSet::new(
//!         store,
//!         StandardRules,
//!         EngineConfig::default(),
//!         genesis,
//!     )
//!     .await?;
//!
//!     // ... link validated blocks, then move the tip:
//!     let target = cs.tip_id().await?;
//!     let outcome = cs.fork_blockchain(target).await?;
//!     println!("reverted {}, applied {}", outcome.reverted.len(), outcome.applied.len());
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! The engine is single-writer: every mutating method takes `&mut self` and
//! a fork is not cancellable once started. Wrap the handle in a
//! `tokio::sync::Mutex` (or equivalent) to serialize callers.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod diffs;
pub mod engine;
pub mod error;
pub mod logging;
pub mod store;
pub mod types;
pub mod validation;

// Re-export main types for convenience.
pub use diffs::{DiffDirection, DiffSet};
pub use engine::{ConsensusSet, ConsensusSetHash, EngineConfig, ForkOutcome};
pub use error::{
    BlockRejection, ConsensusError, ConsensusResult, LoggingError, LoggingResult, StorageError,
    StorageResult,
};
pub use logging::{init_console_logging, init_logging, LoggingConfig, LoggingGuard};
pub use store::{ChainStore, MemoryChainStore, RocksChainStore, StateBatch, StateReader};
pub use tracing::level_filters::LevelFilter;
pub use types::{Block, BlockId, Currency, ProcessedBlock};
pub use validation::{DiffSource, StandardRules, BLOCK_SUBSIDY, MATURITY_DELAY};

/// Current version of the consensus-set library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
