//! Persistent chain store backed by rocksdb.
//!
//! One column family per bucket. A [`StateBatch`] translates to a single
//! rocksdb `WriteBatch`, so every commit is atomic on disk. Heights are
//! encoded big-endian so path and delayed-output scans come back in key
//! order.

use std::path::Path;

use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult};
use crate::store::{BatchOp, ChainStore, StateBatch, StateReader};
use crate::types::{
    BlockId, Currency, FileContract, FileContractId, ProcessedBlock, SiacoinOutput,
    SiacoinOutputId, SiafundOutput, SiafundOutputId,
};

const CF_BLOCKS: &str = "blocks";
const CF_PATH: &str = "path";
const CF_SIACOIN_OUTPUTS: &str = "siacoin_outputs";
const CF_FILE_CONTRACTS: &str = "file_contracts";
const CF_SIAFUND_OUTPUTS: &str = "siafund_outputs";
const CF_DELAYED_OUTPUTS: &str = "delayed_outputs";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 7] = [
    CF_BLOCKS,
    CF_PATH,
    CF_SIACOIN_OUTPUTS,
    CF_FILE_CONTRACTS,
    CF_SIAFUND_OUTPUTS,
    CF_DELAYED_OUTPUTS,
    CF_META,
];

const KEY_SIAFUND_POOL: &[u8] = b"siafund_pool";

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Key in the delayed-output column family: big-endian maturity height
/// followed by the output id.
fn delayed_key(maturity_height: u64, id: &SiacoinOutputId) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&maturity_height.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn split_delayed_key(key: &[u8]) -> StorageResult<(u64, SiacoinOutputId)> {
    if key.len() != 40 {
        return Err(StorageError::Corruption(format!(
            "delayed output key has length {}, expected 40",
            key.len()
        )));
    }
    let mut height = [0u8; 8];
    height.copy_from_slice(&key[..8]);
    let mut id = [0u8; 32];
    id.copy_from_slice(&key[8..]);
    Ok((u64::from_be_bytes(height), SiacoinOutputId(id)))
}

/// rocksdb-backed chain store.
pub struct RocksChainStore {
    db: DB,
}

impl RocksChainStore {
    /// Open (or create) a store rooted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| StorageError::ReadFailed(format!("failed to open database: {}", e)))?;

        Ok(RocksChainStore { db })
    }

    fn cf(&self, name: &str) -> StorageResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Corruption(format!("missing column family: {}", name)))
    }

    fn get_raw(&self, cf_name: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))
    }

    fn get_decoded<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> StorageResult<Option<T>> {
        match self.get_raw(cf_name, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn dump_cf<K, V, F>(&self, cf_name: &str, parse: F) -> StorageResult<Vec<(K, V)>>
    where
        F: Fn(&[u8], &[u8]) -> StorageResult<(K, V)>,
    {
        let cf = self.cf(cf_name)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            entries.push(parse(&key, &value)?);
        }
        Ok(entries)
    }

    fn id_key_32(key: &[u8]) -> StorageResult<[u8; 32]> {
        key.try_into().map_err(|_| {
            StorageError::Corruption(format!("id key has length {}, expected 32", key.len()))
        })
    }
}

#[async_trait]
impl StateReader for RocksChainStore {
    async fn get_siacoin_output(
        &self,
        id: &SiacoinOutputId,
    ) -> StorageResult<Option<SiacoinOutput>> {
        self.get_decoded(CF_SIACOIN_OUTPUTS, id.as_bytes())
    }

    async fn get_file_contract(
        &self,
        id: &FileContractId,
    ) -> StorageResult<Option<FileContract>> {
        self.get_decoded(CF_FILE_CONTRACTS, id.as_bytes())
    }

    async fn get_siafund_output(
        &self,
        id: &SiafundOutputId,
    ) -> StorageResult<Option<SiafundOutput>> {
        self.get_decoded(CF_SIAFUND_OUTPUTS, id.as_bytes())
    }

    async fn delayed_outputs_at(
        &self,
        height: u64,
    ) -> StorageResult<Vec<(SiacoinOutputId, SiacoinOutput)>> {
        let cf = self.cf(CF_DELAYED_OUTPUTS)?;
        let prefix = height.to_be_bytes();
        let mut outputs = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (_, id) = split_delayed_key(&key)?;
            outputs.push((id, decode(&value)?));
        }
        Ok(outputs)
    }

    async fn siafund_pool(&self) -> StorageResult<Currency> {
        Ok(self
            .get_decoded(CF_META, KEY_SIAFUND_POOL)?
            .unwrap_or(Currency::ZERO))
    }
}

#[async_trait]
impl ChainStore for RocksChainStore {
    async fn get_block(&self, id: &BlockId) -> StorageResult<Option<ProcessedBlock>> {
        self.get_decoded(CF_BLOCKS, id.as_bytes())
    }

    async fn put_block(&mut self, pb: &ProcessedBlock) -> StorageResult<()> {
        let cf = self.cf(CF_BLOCKS)?;
        self.db
            .put_cf(cf, pb.id().as_bytes(), encode(pb)?)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    async fn path_at(&self, height: u64) -> StorageResult<Option<BlockId>> {
        match self.get_raw(CF_PATH, &height.to_be_bytes())? {
            Some(bytes) => Ok(Some(BlockId(Self::id_key_32(&bytes)?))),
            None => Ok(None),
        }
    }

    async fn path_tip(&self) -> StorageResult<Option<(u64, BlockId)>> {
        let cf = self.cf(CF_PATH)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
                let height = u64::from_be_bytes(key.as_ref().try_into().map_err(|_| {
                    StorageError::Corruption(format!(
                        "path key has length {}, expected 8",
                        key.len()
                    ))
                })?);
                Ok(Some((height, BlockId(Self::id_key_32(&value)?))))
            }
            None => Ok(None),
        }
    }

    async fn commit(&mut self, batch: StateBatch) -> StorageResult<()> {
        tracing::trace!(ops = batch.len(), "RocksChainStore: committing batch");
        let mut wb = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::PutSiacoinOutput(id, output) => {
                    wb.put_cf(self.cf(CF_SIACOIN_OUTPUTS)?, id.as_bytes(), encode(&output)?);
                }
                BatchOp::DeleteSiacoinOutput(id) => {
                    wb.delete_cf(self.cf(CF_SIACOIN_OUTPUTS)?, id.as_bytes());
                }
                BatchOp::PutFileContract(id, contract) => {
                    wb.put_cf(
                        self.cf(CF_FILE_CONTRACTS)?,
                        id.as_bytes(),
                        encode(&contract)?,
                    );
                }
                BatchOp::DeleteFileContract(id) => {
                    wb.delete_cf(self.cf(CF_FILE_CONTRACTS)?, id.as_bytes());
                }
                BatchOp::PutSiafundOutput(id, output) => {
                    wb.put_cf(self.cf(CF_SIAFUND_OUTPUTS)?, id.as_bytes(), encode(&output)?);
                }
                BatchOp::DeleteSiafundOutput(id) => {
                    wb.delete_cf(self.cf(CF_SIAFUND_OUTPUTS)?, id.as_bytes());
                }
                BatchOp::PutDelayedOutput {
                    maturity_height,
                    id,
                    output,
                } => {
                    wb.put_cf(
                        self.cf(CF_DELAYED_OUTPUTS)?,
                        delayed_key(maturity_height, &id),
                        encode(&output)?,
                    );
                }
                BatchOp::DeleteDelayedOutput {
                    maturity_height,
                    id,
                } => {
                    wb.delete_cf(self.cf(CF_DELAYED_OUTPUTS)?, delayed_key(maturity_height, &id));
                }
                BatchOp::SetSiafundPool(value) => {
                    wb.put_cf(self.cf(CF_META)?, KEY_SIAFUND_POOL, encode(&value)?);
                }
                BatchOp::PushPath(height, id) => {
                    wb.put_cf(self.cf(CF_PATH)?, height.to_be_bytes(), id.as_bytes());
                }
                BatchOp::PopPath(height) => {
                    wb.delete_cf(self.cf(CF_PATH)?, height.to_be_bytes());
                }
                BatchOp::PutBlock(pb) => {
                    wb.put_cf(self.cf(CF_BLOCKS)?, pb.id().as_bytes(), encode(&pb)?);
                }
            }
        }
        self.db
            .write(wb)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    async fn all_siacoin_outputs(
        &self,
    ) -> StorageResult<Vec<(SiacoinOutputId, SiacoinOutput)>> {
        self.dump_cf(CF_SIACOIN_OUTPUTS, |key, value| {
            Ok((SiacoinOutputId(Self::id_key_32(key)?), decode(value)?))
        })
    }

    async fn all_file_contracts(&self) -> StorageResult<Vec<(FileContractId, FileContract)>> {
        self.dump_cf(CF_FILE_CONTRACTS, |key, value| {
            Ok((FileContractId(Self::id_key_32(key)?), decode(value)?))
        })
    }

    async fn all_siafund_outputs(
        &self,
    ) -> StorageResult<Vec<(SiafundOutputId, SiafundOutput)>> {
        self.dump_cf(CF_SIAFUND_OUTPUTS, |key, value| {
            Ok((SiafundOutputId(Self::id_key_32(key)?), decode(value)?))
        })
    }

    async fn all_delayed_outputs(
        &self,
    ) -> StorageResult<Vec<(u64, SiacoinOutputId, SiacoinOutput)>> {
        let entries = self.dump_cf(CF_DELAYED_OUTPUTS, |key, value| {
            Ok((split_delayed_key(key)?, decode::<SiacoinOutput>(value)?))
        })?;
        Ok(entries
            .into_iter()
            .map(|((height, id), output)| (height, id, output))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnlockHash;
    use tempfile::TempDir;

    fn output(value: u128) -> SiacoinOutput {
        SiacoinOutput {
            value: Currency(value),
            unlock_hash: UnlockHash([9u8; 32]),
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = SiacoinOutputId([3u8; 32]);

        {
            let mut store = RocksChainStore::open(dir.path()).await.unwrap();
            let mut batch = StateBatch::new();
            batch.put_siacoin_output(id, output(42));
            batch.set_siafund_pool(Currency(7));
            batch.push_path(0, BlockId([1u8; 32]));
            store.commit(batch).await.unwrap();
        }

        let store = RocksChainStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get_siacoin_output(&id).await.unwrap().unwrap().value,
            Currency(42)
        );
        assert_eq!(store.siafund_pool().await.unwrap(), Currency(7));
        assert_eq!(
            store.path_tip().await.unwrap(),
            Some((0, BlockId([1u8; 32])))
        );
    }

    #[tokio::test]
    async fn delayed_output_scan_respects_height_prefix() {
        let dir = TempDir::new().unwrap();
        let mut store = RocksChainStore::open(dir.path()).await.unwrap();

        let mut batch = StateBatch::new();
        batch.put_delayed_output(50, SiacoinOutputId([1u8; 32]), output(1));
        batch.put_delayed_output(51, SiacoinOutputId([2u8; 32]), output(2));
        batch.put_delayed_output(51, SiacoinOutputId([3u8; 32]), output(3));
        store.commit(batch).await.unwrap();

        assert_eq!(store.delayed_outputs_at(50).await.unwrap().len(), 1);
        assert_eq!(store.delayed_outputs_at(51).await.unwrap().len(), 2);
        assert_eq!(store.delayed_outputs_at(52).await.unwrap().len(), 0);

        let all = store.all_delayed_outputs().await.unwrap();
        assert_eq!(all.len(), 3);
        // Sorted by (height, id).
        assert!(all.windows(2).all(|w| (w[0].0, w[0].1) <= (w[1].0, w[1].1)));
    }

    #[tokio::test]
    async fn path_pop_rewinds_tip() {
        let dir = TempDir::new().unwrap();
        let mut store = RocksChainStore::open(dir.path()).await.unwrap();

        let mut batch = StateBatch::new();
        for h in 0..3u64 {
            batch.push_path(h, BlockId([h as u8; 32]));
        }
        store.commit(batch).await.unwrap();
        assert_eq!(store.path_tip().await.unwrap().unwrap().0, 2);

        let mut batch = StateBatch::new();
        batch.pop_path(2);
        store.commit(batch).await.unwrap();
        assert_eq!(store.path_tip().await.unwrap().unwrap().0, 1);
        assert_eq!(store.path_at(2).await.unwrap(), None);
    }
}
