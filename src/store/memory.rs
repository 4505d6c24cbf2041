//! In-memory chain store implementation.
//!
//! Buckets are `BTreeMap`s so dumps come out key-sorted for free. Batch
//! application cannot fail partway, which makes atomicity trivial; the
//! disk backend is where the write-batch contract earns its keep.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use crate::error::StorageResult;
use crate::store::{BatchOp, ChainStore, StateBatch, StateReader};
use crate::types::{
    BlockId, Currency, FileContract, FileContractId, ProcessedBlock, SiacoinOutput,
    SiacoinOutputId, SiafundOutput, SiafundOutputId,
};

/// In-memory chain store.
pub struct MemoryChainStore {
    blocks: HashMap<BlockId, ProcessedBlock>,
    path: BTreeMap<u64, BlockId>,
    siacoin_outputs: BTreeMap<SiacoinOutputId, SiacoinOutput>,
    file_contracts: BTreeMap<FileContractId, FileContract>,
    siafund_outputs: BTreeMap<SiafundOutputId, SiafundOutput>,
    delayed_outputs: BTreeMap<(u64, SiacoinOutputId), SiacoinOutput>,
    siafund_pool: Currency,
}

impl MemoryChainStore {
    /// Create an empty memory store.
    pub async fn new() -> StorageResult<Self> {
        Ok(MemoryChainStore {
            blocks: HashMap::new(),
            path: BTreeMap::new(),
            siacoin_outputs: BTreeMap::new(),
            file_contracts: BTreeMap::new(),
            siafund_outputs: BTreeMap::new(),
            delayed_outputs: BTreeMap::new(),
            siafund_pool: Currency::ZERO,
        })
    }

    fn apply_op(&mut self, op: BatchOp) {
        match op {
            BatchOp::PutSiacoinOutput(id, output) => {
                self.siacoin_outputs.insert(id, output);
            }
            BatchOp::DeleteSiacoinOutput(id) => {
                self.siacoin_outputs.remove(&id);
            }
            BatchOp::PutFileContract(id, contract) => {
                self.file_contracts.insert(id, contract);
            }
            BatchOp::DeleteFileContract(id) => {
                self.file_contracts.remove(&id);
            }
            BatchOp::PutSiafundOutput(id, output) => {
                self.siafund_outputs.insert(id, output);
            }
            BatchOp::DeleteSiafundOutput(id) => {
                self.siafund_outputs.remove(&id);
            }
            BatchOp::PutDelayedOutput {
                maturity_height,
                id,
                output,
            } => {
                self.delayed_outputs.insert((maturity_height, id), output);
            }
            BatchOp::DeleteDelayedOutput {
                maturity_height,
                id,
            } => {
                self.delayed_outputs.remove(&(maturity_height, id));
            }
            BatchOp::SetSiafundPool(value) => {
                self.siafund_pool = value;
            }
            BatchOp::PushPath(height, id) => {
                self.path.insert(height, id);
            }
            BatchOp::PopPath(height) => {
                self.path.remove(&height);
            }
            BatchOp::PutBlock(pb) => {
                self.blocks.insert(pb.id(), pb);
            }
        }
    }
}

#[async_trait]
impl StateReader for MemoryChainStore {
    async fn get_siacoin_output(
        &self,
        id: &SiacoinOutputId,
    ) -> StorageResult<Option<SiacoinOutput>> {
        Ok(self.siacoin_outputs.get(id).cloned())
    }

    async fn get_file_contract(
        &self,
        id: &FileContractId,
    ) -> StorageResult<Option<FileContract>> {
        Ok(self.file_contracts.get(id).cloned())
    }

    async fn get_siafund_output(
        &self,
        id: &SiafundOutputId,
    ) -> StorageResult<Option<SiafundOutput>> {
        Ok(self.siafund_outputs.get(id).cloned())
    }

    async fn delayed_outputs_at(
        &self,
        height: u64,
    ) -> StorageResult<Vec<(SiacoinOutputId, SiacoinOutput)>> {
        let lo = (height, SiacoinOutputId([0u8; 32]));
        let hi = (height, SiacoinOutputId([0xffu8; 32]));
        Ok(self
            .delayed_outputs
            .range(lo..=hi)
            .map(|((_, id), output)| (*id, output.clone()))
            .collect())
    }

    async fn siafund_pool(&self) -> StorageResult<Currency> {
        Ok(self.siafund_pool)
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    async fn get_block(&self, id: &BlockId) -> StorageResult<Option<ProcessedBlock>> {
        Ok(self.blocks.get(id).cloned())
    }

    async fn put_block(&mut self, pb: &ProcessedBlock) -> StorageResult<()> {
        self.blocks.insert(pb.id(), pb.clone());
        Ok(())
    }

    async fn path_at(&self, height: u64) -> StorageResult<Option<BlockId>> {
        Ok(self.path.get(&height).copied())
    }

    async fn path_tip(&self) -> StorageResult<Option<(u64, BlockId)>> {
        Ok(self.path.iter().next_back().map(|(h, id)| (*h, *id)))
    }

    async fn commit(&mut self, batch: StateBatch) -> StorageResult<()> {
        tracing::trace!(ops = batch.len(), "MemoryChainStore: committing batch");
        for op in batch.into_ops() {
            self.apply_op(op);
        }
        Ok(())
    }

    async fn all_siacoin_outputs(
        &self,
    ) -> StorageResult<Vec<(SiacoinOutputId, SiacoinOutput)>> {
        Ok(self
            .siacoin_outputs
            .iter()
            .map(|(id, output)| (*id, output.clone()))
            .collect())
    }

    async fn all_file_contracts(&self) -> StorageResult<Vec<(FileContractId, FileContract)>> {
        Ok(self
            .file_contracts
            .iter()
            .map(|(id, contract)| (*id, contract.clone()))
            .collect())
    }

    async fn all_siafund_outputs(
        &self,
    ) -> StorageResult<Vec<(SiafundOutputId, SiafundOutput)>> {
        Ok(self
            .siafund_outputs
            .iter()
            .map(|(id, output)| (*id, output.clone()))
            .collect())
    }

    async fn all_delayed_outputs(
        &self,
    ) -> StorageResult<Vec<(u64, SiacoinOutputId, SiacoinOutput)>> {
        Ok(self
            .delayed_outputs
            .iter()
            .map(|((height, id), output)| (*height, *id, output.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnlockHash;

    fn output(value: u128) -> SiacoinOutput {
        SiacoinOutput {
            value: Currency(value),
            unlock_hash: UnlockHash([7u8; 32]),
        }
    }

    #[tokio::test]
    async fn batch_ops_apply_in_order() {
        let mut store = MemoryChainStore::new().await.unwrap();
        let id = SiacoinOutputId([1u8; 32]);

        let mut batch = StateBatch::new();
        batch.put_siacoin_output(id, output(10));
        batch.delete_siacoin_output(id);
        batch.put_siacoin_output(id, output(20));
        store.commit(batch).await.unwrap();

        let got = store.get_siacoin_output(&id).await.unwrap().unwrap();
        assert_eq!(got.value, Currency(20));
    }

    #[tokio::test]
    async fn path_tip_tracks_highest_entry() {
        let mut store = MemoryChainStore::new().await.unwrap();
        assert_eq!(store.path_tip().await.unwrap(), None);

        let mut batch = StateBatch::new();
        batch.push_path(0, BlockId([0u8; 32]));
        batch.push_path(1, BlockId([1u8; 32]));
        store.commit(batch).await.unwrap();
        assert_eq!(
            store.path_tip().await.unwrap(),
            Some((1, BlockId([1u8; 32])))
        );

        let mut batch = StateBatch::new();
        batch.pop_path(1);
        store.commit(batch).await.unwrap();
        assert_eq!(
            store.path_tip().await.unwrap(),
            Some((0, BlockId([0u8; 32])))
        );
        assert_eq!(store.path_at(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delayed_outputs_filter_by_maturity_height() {
        let mut store = MemoryChainStore::new().await.unwrap();
        let mut batch = StateBatch::new();
        batch.put_delayed_output(50, SiacoinOutputId([1u8; 32]), output(1));
        batch.put_delayed_output(50, SiacoinOutputId([2u8; 32]), output(2));
        batch.put_delayed_output(51, SiacoinOutputId([3u8; 32]), output(3));
        store.commit(batch).await.unwrap();

        let at_50 = store.delayed_outputs_at(50).await.unwrap();
        assert_eq!(at_50.len(), 2);
        assert!(at_50.iter().all(|(id, _)| id.0[0] < 3));
        assert_eq!(store.delayed_outputs_at(52).await.unwrap().len(), 0);
        assert_eq!(store.all_delayed_outputs().await.unwrap().len(), 3);
    }
}
