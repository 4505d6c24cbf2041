//! Fork coordinator: moving the consensus set between branches of the block
//! tree.
//!
//! `fork_blockchain` is atomic: it either finishes with the requested tip,
//! or restores the pre-call state bit for bit and reports why. Reverts all
//! complete before any applies begin, and applies proceed in strict
//! ascending-height order along the target branch.

use crate::diffs::DiffDirection;
use crate::error::{ConsensusError, ConsensusResult};
use crate::store::ChainStore;
use crate::types::{BlockId, ProcessedBlock};
use crate::validation::DiffSource;

use super::{ConsensusSet, ConsensusSetHash, ForkOutcome};

impl<S: ChainStore, R: DiffSource> ConsensusSet<S, R> {
    /// Walk from `pb` toward genesis until a block on the current path (the
    /// common parent) is reached. Returns the blocks from the common parent
    /// up to and including `pb`, in ascending-height order; the result has
    /// at least one element and element 0 is the common parent.
    ///
    /// Terminates because genesis is always on the current path. An orphan
    /// ancestry is a caller bug and surfaces as `UnknownBlock`.
    pub(crate) async fn backtrack_to_current_path(
        &self,
        pb: ProcessedBlock,
    ) -> ConsensusResult<Vec<ProcessedBlock>> {
        let (tip_height, _) = self.tip().await?;
        let mut path = vec![pb];
        loop {
            let current = path.last().expect("path starts non-empty");
            if current.height <= tip_height
                && self.store.path_at(current.height).await? == Some(current.id())
            {
                break;
            }
            let parent_id = current.parent_id();
            let parent = self
                .store
                .get_block(&parent_id)
                .await?
                .ok_or(ConsensusError::UnknownBlock(parent_id))?;
            path.push(parent);
        }
        path.reverse();
        Ok(path)
    }

    /// Revert tip blocks one at a time until `pb` is the tip. `pb` itself is
    /// not reverted. Returns the reverted blocks in the order they were
    /// reverted (highest first).
    ///
    /// `pb` must lie on the current path; anything else is a caller bug and
    /// fails with [`ConsensusError::ExternalRevert`].
    pub(crate) async fn revert_to_node(
        &mut self,
        pb: &ProcessedBlock,
    ) -> ConsensusResult<Vec<ProcessedBlock>> {
        let (tip_height, _) = self.tip().await?;
        if pb.height > tip_height || self.store.path_at(pb.height).await? != Some(pb.id()) {
            return Err(ConsensusError::ExternalRevert);
        }

        let mut reverted = Vec::new();
        while self.tip().await?.1 != pb.id() {
            let node = self.current_block().await?;
            self.commit_diff_set(&node, DiffDirection::Revert).await?;
            reverted.push(node);
        }
        Ok(reverted)
    }

    /// Apply the blocks between the current tip and `pb`, in ascending
    /// height order. Blocks with stored diffs go through the committer;
    /// blocks seen for the first time go through the generator.
    ///
    /// Stops at the first rejected block: everything applied before the
    /// failure stays committed, and the caller is responsible for rolling
    /// it back.
    pub(crate) async fn apply_until_node(
        &mut self,
        pb: &ProcessedBlock,
    ) -> ConsensusResult<Vec<ProcessedBlock>> {
        let new_path = self.backtrack_to_current_path(pb.clone()).await?;
        let mut applied = Vec::new();
        for node in new_path.into_iter().skip(1) {
            let committed = if node.diffs_generated {
                self.commit_diff_set(&node, DiffDirection::Apply).await?;
                node
            } else {
                match self.generate_and_apply(&node).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        tracing::debug!(
                            block = %node.id(),
                            applied = applied.len(),
                            error = %err,
                            "apply halted"
                        );
                        return Err(err);
                    }
                }
            };
            applied.push(committed);
        }
        Ok(applied)
    }

    /// Move the consensus set onto the branch ending at `new_tip`.
    ///
    /// On success, returns the reverted and applied block ids. If a block on
    /// the new branch is rejected, the original path is restored from its
    /// stored diff sets and the rejection is returned; any failure during
    /// that restoration is [`ConsensusError::Recovery`] and means the
    /// consensus state can no longer be trusted.
    pub async fn fork_blockchain(&mut self, new_tip: BlockId) -> ConsensusResult<ForkOutcome> {
        // Fail fast on an unknown target without touching state.
        let target = self
            .store
            .get_block(&new_tip)
            .await?
            .ok_or(ConsensusError::UnknownBlock(new_tip))?;

        let old_tip = self.current_block().await?;
        let old_hash = if self.config.verify_state_hash {
            Some(self.consensus_set_hash().await?)
        } else {
            None
        };

        let new_path = self.backtrack_to_current_path(target.clone()).await?;
        let common_parent = new_path[0].clone();
        let reverted = self.revert_to_node(&common_parent).await?;

        match self.apply_until_node(&target).await {
            Ok(applied) => {
                if !reverted.is_empty() || !applied.is_empty() {
                    tracing::info!(
                        reverted = reverted.len(),
                        applied = applied.len(),
                        tip = %new_tip,
                        height = target.height,
                        "switched to new branch"
                    );
                }
                Ok(ForkOutcome {
                    reverted: reverted.iter().map(|pb| pb.id()).collect(),
                    applied: applied.iter().map(|pb| pb.id()).collect(),
                })
            }
            Err(err @ ConsensusError::InvalidBlock(_)) => {
                tracing::warn!(
                    tip = %new_tip,
                    error = %err,
                    "new branch contains an invalid block, restoring original path"
                );
                self.restore_original_path(&common_parent, &old_tip, old_hash)
                    .await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Undo a partially-applied fork: revert back to the common parent, then
    /// reapply the original path. Every block on the original path has its
    /// diffs stored (it was applied at least once), so the reapply never
    /// consults the generator and cannot be rejected; any error here means
    /// the store is corrupt.
    async fn restore_original_path(
        &mut self,
        common_parent: &ProcessedBlock,
        old_tip: &ProcessedBlock,
        old_hash: Option<ConsensusSetHash>,
    ) -> ConsensusResult<()> {
        self.revert_to_node(common_parent).await.map_err(|e| {
            ConsensusError::Recovery(format!("revert to common parent failed: {}", e))
        })?;
        self.apply_until_node(old_tip).await.map_err(|e| {
            ConsensusError::Recovery(format!("reapply of original path failed: {}", e))
        })?;

        if let Some(expected) = old_hash {
            let actual = self.consensus_set_hash().await?;
            if actual != expected {
                tracing::error!(
                    %expected,
                    %actual,
                    "state hash changed across a failed fork attempt"
                );
                return Err(ConsensusError::Recovery(
                    "state hash mismatch after restoring original path".into(),
                ));
            }
        }
        Ok(())
    }
}
