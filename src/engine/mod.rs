//! The consensus set: an owned handle over the block tree, current path,
//! and live state, plus the fork/reorganization engine.
//!
//! The engine is single-writer by construction: every mutating operation
//! takes `&mut self`, and an embedding node serializes callers (for example
//! behind a `tokio::sync::Mutex`). The handle holds no global state.

mod committer;
mod fork;
mod generator;

#[cfg(test)]
mod fork_test;

use sha2::{Digest, Sha256};

use crate::diffs::{BucketDiff, DelayedOutputDiff, DiffDirection, DiffSet};
use crate::error::{ConsensusError, ConsensusResult};
use crate::store::{ChainStore, StateBatch};
use crate::types::{Block, BlockId, ProcessedBlock};
use crate::validation::{DiffSource, MATURITY_DELAY};

/// Engine behavior flags.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recompute the consensus state hash around failed forks and fail with
    /// [`ConsensusError::Recovery`] if recovery did not restore it exactly.
    /// Costs a full state walk per failed fork; intended for tests and
    /// high-assurance deployments.
    pub verify_state_hash: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            verify_state_hash: false,
        }
    }
}

/// Result of a completed fork: the blocks removed from and added to the
/// current path, in the order they were reverted/applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkOutcome {
    pub reverted: Vec<BlockId>,
    pub applied: Vec<BlockId>,
}

/// Deterministic digest of the entire consensus state: every state bucket in
/// sorted key order, the siafund pool, and the current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusSetHash(pub [u8; 32]);

impl std::fmt::Display for ConsensusSetHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The consensus set.
pub struct ConsensusSet<S, R> {
    store: S,
    rules: R,
    config: EngineConfig,
}

impl<S: ChainStore, R: DiffSource> ConsensusSet<S, R> {
    /// Open a consensus set over `store`. An empty store is seeded with
    /// `genesis` at height 0; a non-empty store must agree on the genesis
    /// id.
    pub async fn new(
        store: S,
        rules: R,
        config: EngineConfig,
        genesis: Block,
    ) -> ConsensusResult<Self> {
        let mut cs = ConsensusSet {
            store,
            rules,
            config,
        };
        match cs.store.path_tip().await? {
            None => cs.seed_genesis(genesis).await?,
            Some(_) => {
                let on_path = cs.store.path_at(0).await?.ok_or_else(|| {
                    ConsensusError::Inconsistent("current path has no genesis entry".into())
                })?;
                if on_path != genesis.id() {
                    return Err(ConsensusError::Inconsistent(format!(
                        "store was seeded with a different genesis: {}",
                        on_path
                    )));
                }
            }
        }
        Ok(cs)
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Height and id of the current-path tip.
    pub async fn tip(&self) -> ConsensusResult<(u64, BlockId)> {
        self.store
            .path_tip()
            .await?
            .ok_or_else(|| ConsensusError::Inconsistent("store has no current path".into()))
    }

    pub async fn tip_height(&self) -> ConsensusResult<u64> {
        Ok(self.tip().await?.0)
    }

    pub async fn tip_id(&self) -> ConsensusResult<BlockId> {
        Ok(self.tip().await?.1)
    }

    /// The processed block at the tip of the current path.
    pub async fn current_block(&self) -> ConsensusResult<ProcessedBlock> {
        let (_, tip_id) = self.tip().await?;
        self.store.get_block(&tip_id).await?.ok_or_else(|| {
            ConsensusError::Inconsistent(format!("tip block {} missing from block map", tip_id))
        })
    }

    /// Canonical block id at `height`, or None above the tip.
    pub async fn path_at(&self, height: u64) -> ConsensusResult<Option<BlockId>> {
        Ok(self.store.path_at(height).await?)
    }

    /// Link a validated block into the block tree without applying it. The
    /// parent must already be in the tree; the block becomes a fork-choice
    /// candidate for [`Self::fork_blockchain`].
    pub async fn link_block(&mut self, block: Block) -> ConsensusResult<ProcessedBlock> {
        let parent = self
            .store
            .get_block(&block.parent_id)
            .await?
            .ok_or(ConsensusError::UnknownBlock(block.parent_id))?;
        let pb = ProcessedBlock::new(block, parent.height + 1);
        self.store.put_block(&pb).await?;
        tracing::debug!(block = %pb.id(), height = pb.height, "linked block into tree");
        Ok(pb)
    }

    /// Install the genesis block: its transaction outputs seed the state
    /// buckets directly (genesis allocations are not rule-checked) and its
    /// miner payouts mature after the usual delay.
    async fn seed_genesis(&mut self, genesis: Block) -> ConsensusResult<()> {
        let mut diff_set = DiffSet::default();
        for tx in &genesis.transactions {
            for (index, output) in tx.siacoin_outputs.iter().enumerate() {
                diff_set.siacoin_output_diffs.push(BucketDiff::Created {
                    id: tx.siacoin_output_id(index as u64),
                    value: output.clone(),
                });
            }
            for (index, output) in tx.siafund_outputs.iter().enumerate() {
                diff_set.siafund_output_diffs.push(BucketDiff::Created {
                    id: tx.siafund_output_id(index as u64),
                    value: output.clone(),
                });
            }
        }
        for (index, payout) in genesis.miner_payouts.iter().enumerate() {
            diff_set.delayed_output_diffs.push(DelayedOutputDiff {
                maturity_height: MATURITY_DELAY,
                diff: BucketDiff::Created {
                    id: genesis.miner_payout_id(index as u64),
                    value: payout.clone(),
                },
            });
        }

        let pb = ProcessedBlock {
            height: 0,
            diffs_generated: true,
            diff_set,
            block: genesis,
        };

        let mut batch = StateBatch::new();
        committer::stage_diff_set(&mut batch, &pb.diff_set, DiffDirection::Apply);
        batch.push_path(0, pb.id());
        batch.put_block(pb.clone());
        self.store.commit(batch).await?;
        tracing::info!(genesis = %pb.id(), "seeded consensus set");
        Ok(())
    }

    /// Digest of all state buckets, the pool, and the current path. Pure
    /// function of the current path's diff history; used by the
    /// post-recovery self-check and by tests.
    pub async fn consensus_set_hash(&self) -> ConsensusResult<ConsensusSetHash> {
        let mut hasher = Sha256::new();

        let (tip_height, _) = self.tip().await?;
        hasher.update(b"path");
        for height in 0..=tip_height {
            let id = self.store.path_at(height).await?.ok_or_else(|| {
                ConsensusError::Inconsistent(format!("current path has a gap at {}", height))
            })?;
            hasher.update(height.to_be_bytes());
            hasher.update(id.as_bytes());
        }

        hasher.update(b"pool");
        hasher.update(self.store.siafund_pool().await?.0.to_be_bytes());

        hasher.update(b"siacoin outputs");
        for (id, output) in self.store.all_siacoin_outputs().await? {
            hasher.update(id.as_bytes());
            hasher.update(encode_for_hash(&output)?);
        }

        hasher.update(b"file contracts");
        for (id, contract) in self.store.all_file_contracts().await? {
            hasher.update(id.as_bytes());
            hasher.update(encode_for_hash(&contract)?);
        }

        hasher.update(b"siafund outputs");
        for (id, output) in self.store.all_siafund_outputs().await? {
            hasher.update(id.as_bytes());
            hasher.update(encode_for_hash(&output)?);
        }

        hasher.update(b"delayed outputs");
        for (maturity, id, output) in self.store.all_delayed_outputs().await? {
            hasher.update(maturity.to_be_bytes());
            hasher.update(id.as_bytes());
            hasher.update(encode_for_hash(&output)?);
        }

        Ok(ConsensusSetHash(hasher.finalize().into()))
    }
}

fn encode_for_hash<T: serde::Serialize>(value: &T) -> ConsensusResult<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| crate::error::StorageError::Serialization(e.to_string()).into())
}
