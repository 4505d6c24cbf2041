//! Storage abstraction for the consensus set.
//!
//! The engine reads the block tree and live state through [`ChainStore`] and
//! mutates them exclusively through [`StateBatch`] commits: the committer
//! builds an ordered batch of bucket operations and the store applies it
//! atomically. A failed commit must leave every bucket untouched.

pub mod disk;
pub mod memory;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::{
    BlockId, Currency, FileContract, FileContractId, ProcessedBlock, SiacoinOutput,
    SiacoinOutputId, SiafundOutput, SiafundOutputId,
};

pub use disk::RocksChainStore;
pub use memory::MemoryChainStore;

/// Read-only view of live consensus state.
///
/// This is the surface the diff generator's rule set sees: the state
/// immediately after the current tip, which is the pre-block state of any
/// block extending it.
#[async_trait]
pub trait StateReader: Send + Sync {
    async fn get_siacoin_output(
        &self,
        id: &SiacoinOutputId,
    ) -> StorageResult<Option<SiacoinOutput>>;

    async fn get_file_contract(&self, id: &FileContractId)
        -> StorageResult<Option<FileContract>>;

    async fn get_siafund_output(
        &self,
        id: &SiafundOutputId,
    ) -> StorageResult<Option<SiafundOutput>>;

    /// Delayed outputs maturing exactly at `height`, sorted by id.
    async fn delayed_outputs_at(
        &self,
        height: u64,
    ) -> StorageResult<Vec<(SiacoinOutputId, SiacoinOutput)>>;

    /// Current value of the siafund pool.
    async fn siafund_pool(&self) -> StorageResult<Currency>;
}

/// Persistent block tree plus current path plus state buckets.
///
/// All bucket dumps return entries sorted by key; the consensus state hash
/// depends on that ordering being deterministic across implementations.
#[async_trait]
pub trait ChainStore: StateReader {
    /// Fetch a processed block by id.
    async fn get_block(&self, id: &BlockId) -> StorageResult<Option<ProcessedBlock>>;

    /// Insert or overwrite a processed block record. Used by the external
    /// validator when linking new blocks into the tree; the engine itself
    /// updates block records only through [`StateBatch::put_block`].
    async fn put_block(&mut self, pb: &ProcessedBlock) -> StorageResult<()>;

    /// Canonical block id at `height`, or None above the tip.
    async fn path_at(&self, height: u64) -> StorageResult<Option<BlockId>>;

    /// Height and id of the current-path tip, or None if the store has not
    /// been seeded with genesis yet.
    async fn path_tip(&self) -> StorageResult<Option<(u64, BlockId)>>;

    /// Atomically apply a write batch. Either every operation takes effect
    /// or none does.
    async fn commit(&mut self, batch: StateBatch) -> StorageResult<()>;

    async fn all_siacoin_outputs(&self)
        -> StorageResult<Vec<(SiacoinOutputId, SiacoinOutput)>>;

    async fn all_file_contracts(&self) -> StorageResult<Vec<(FileContractId, FileContract)>>;

    async fn all_siafund_outputs(&self)
        -> StorageResult<Vec<(SiafundOutputId, SiafundOutput)>>;

    /// Every delayed output, sorted by (maturity height, id).
    async fn all_delayed_outputs(
        &self,
    ) -> StorageResult<Vec<(u64, SiacoinOutputId, SiacoinOutput)>>;
}

/// A single operation inside a [`StateBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    PutSiacoinOutput(SiacoinOutputId, SiacoinOutput),
    DeleteSiacoinOutput(SiacoinOutputId),
    PutFileContract(FileContractId, FileContract),
    DeleteFileContract(FileContractId),
    PutSiafundOutput(SiafundOutputId, SiafundOutput),
    DeleteSiafundOutput(SiafundOutputId),
    PutDelayedOutput {
        maturity_height: u64,
        id: SiacoinOutputId,
        output: SiacoinOutput,
    },
    DeleteDelayedOutput {
        maturity_height: u64,
        id: SiacoinOutputId,
    },
    SetSiafundPool(Currency),
    /// Append `(height, id)` to the current path.
    PushPath(u64, BlockId),
    /// Remove the path entry at `height`.
    PopPath(u64),
    /// Update a block record (diff metadata) alongside its state effects.
    PutBlock(ProcessedBlock),
}

/// An ordered group of bucket operations committed as one transaction.
///
/// Construction is cheap and purely in-memory; dropping an uncommitted batch
/// aborts it with no effect on the store.
#[derive(Debug, Default)]
pub struct StateBatch {
    ops: Vec<BatchOp>,
}

impl StateBatch {
    pub fn new() -> Self {
        StateBatch::default()
    }

    pub fn put_siacoin_output(&mut self, id: SiacoinOutputId, output: SiacoinOutput) {
        self.ops.push(BatchOp::PutSiacoinOutput(id, output));
    }

    pub fn delete_siacoin_output(&mut self, id: SiacoinOutputId) {
        self.ops.push(BatchOp::DeleteSiacoinOutput(id));
    }

    pub fn put_file_contract(&mut self, id: FileContractId, contract: FileContract) {
        self.ops.push(BatchOp::PutFileContract(id, contract));
    }

    pub fn delete_file_contract(&mut self, id: FileContractId) {
        self.ops.push(BatchOp::DeleteFileContract(id));
    }

    pub fn put_siafund_output(&mut self, id: SiafundOutputId, output: SiafundOutput) {
        self.ops.push(BatchOp::PutSiafundOutput(id, output));
    }

    pub fn delete_siafund_output(&mut self, id: SiafundOutputId) {
        self.ops.push(BatchOp::DeleteSiafundOutput(id));
    }

    pub fn put_delayed_output(
        &mut self,
        maturity_height: u64,
        id: SiacoinOutputId,
        output: SiacoinOutput,
    ) {
        self.ops.push(BatchOp::PutDelayedOutput {
            maturity_height,
            id,
            output,
        });
    }

    pub fn delete_delayed_output(&mut self, maturity_height: u64, id: SiacoinOutputId) {
        self.ops.push(BatchOp::DeleteDelayedOutput {
            maturity_height,
            id,
        });
    }

    pub fn set_siafund_pool(&mut self, value: Currency) {
        self.ops.push(BatchOp::SetSiafundPool(value));
    }

    pub fn push_path(&mut self, height: u64, id: BlockId) {
        self.ops.push(BatchOp::PushPath(height, id));
    }

    pub fn pop_path(&mut self, height: u64) {
        self.ops.push(BatchOp::PopPath(height));
    }

    pub fn put_block(&mut self, pb: ProcessedBlock) {
        self.ops.push(BatchOp::PutBlock(pb));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding its operations in insertion order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
