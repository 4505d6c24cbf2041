//! Diff generator: first-time application of a block.
//!
//! Generation is non-idempotent work and runs at most once per block: the
//! rule set produces the diff set, and the diff metadata, every state delta,
//! and the current-path entry are committed in a single store transaction.
//! Every later application of the block goes through the committer using
//! the stored diffs.

use crate::diffs::DiffDirection;
use crate::error::{ConsensusError, ConsensusResult};
use crate::store::{ChainStore, StateBatch};
use crate::types::ProcessedBlock;
use crate::validation::DiffSource;

use super::committer::stage_diff_set;
use super::ConsensusSet;

impl<S: ChainStore, R: DiffSource> ConsensusSet<S, R> {
    /// Generate `pb`'s diff set from the current (pre-block) state and apply
    /// it. On rejection the error is [`ConsensusError::InvalidBlock`] and no
    /// state is touched; `diffs_generated` stays false.
    ///
    /// Returns the updated block record as committed to the store.
    pub(crate) async fn generate_and_apply(
        &mut self,
        pb: &ProcessedBlock,
    ) -> ConsensusResult<ProcessedBlock> {
        let (_, tip_id) = self.tip().await?;
        if pb.parent_id() != tip_id {
            return Err(ConsensusError::Inconsistent(format!(
                "diff generation for block {} which does not extend the tip {}",
                pb.id(),
                tip_id
            )));
        }
        if pb.diffs_generated {
            return Err(ConsensusError::Inconsistent(format!(
                "diff generation requested twice for block {}",
                pb.id()
            )));
        }

        let diff_set = self.rules.generate(&self.store, pb).await?;

        let mut updated = pb.clone();
        updated.diff_set = diff_set;
        updated.diffs_generated = true;

        // Metadata, state deltas, and path entry land in one transaction:
        // either the block is fully applied with its diffs recorded, or
        // nothing changed.
        let mut batch = StateBatch::new();
        stage_diff_set(&mut batch, &updated.diff_set, DiffDirection::Apply);
        batch.push_path(updated.height, updated.id());
        batch.put_block(updated.clone());
        self.store.commit(batch).await?;

        tracing::debug!(
            block = %updated.id(),
            height = updated.height,
            deltas = updated.diff_set.len(),
            "generated and applied diff set"
        );
        Ok(updated)
    }
}
