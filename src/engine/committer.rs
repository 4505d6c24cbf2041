//! Diff committer: installs or rolls back a single block's diff set.
//!
//! The engine trusts stored diff sets completely. A diff set that was
//! corrupted after generation is not detectable here and will surface as an
//! `Inconsistent`/`Storage` failure (or a state-hash mismatch) rather than
//! an invalid-block rejection.

use crate::diffs::{BucketDiff, DiffDirection, DiffSet};
use crate::error::{ConsensusError, ConsensusResult};
use crate::store::{ChainStore, StateBatch};
use crate::types::ProcessedBlock;
use crate::validation::DiffSource;

use super::ConsensusSet;

/// Translate one bucket diff into its effect for the given direction.
macro_rules! stage_bucket_diff {
    ($batch:expr, $diff:expr, $direction:expr, $put:ident, $delete:ident) => {
        match ($diff, $direction) {
            (BucketDiff::Created { id, value }, DiffDirection::Apply)
            | (BucketDiff::Removed { id, value }, DiffDirection::Revert) => {
                $batch.$put(*id, value.clone());
            }
            (BucketDiff::Created { id, .. }, DiffDirection::Revert)
            | (BucketDiff::Removed { id, .. }, DiffDirection::Apply) => {
                $batch.$delete(*id);
            }
        }
    };
}

/// Stage every delta of `diffs` onto `batch`.
///
/// Apply installs deltas in recorded order; revert installs the inverse
/// deltas in exact reverse order (across buckets as well as within them), so
/// apply then revert is the identity on state.
pub(crate) fn stage_diff_set(batch: &mut StateBatch, diffs: &DiffSet, direction: DiffDirection) {
    match direction {
        DiffDirection::Apply => {
            for diff in &diffs.siacoin_output_diffs {
                stage_bucket_diff!(batch, diff, direction, put_siacoin_output, delete_siacoin_output);
            }
            for diff in &diffs.file_contract_diffs {
                stage_bucket_diff!(batch, diff, direction, put_file_contract, delete_file_contract);
            }
            for diff in &diffs.siafund_output_diffs {
                stage_bucket_diff!(batch, diff, direction, put_siafund_output, delete_siafund_output);
            }
            for delayed in &diffs.delayed_output_diffs {
                stage_delayed_diff(batch, delayed, direction);
            }
            for pool in &diffs.siafund_pool_diffs {
                batch.set_siafund_pool(pool.adjusted);
            }
        }
        DiffDirection::Revert => {
            for pool in diffs.siafund_pool_diffs.iter().rev() {
                batch.set_siafund_pool(pool.previous);
            }
            for delayed in diffs.delayed_output_diffs.iter().rev() {
                stage_delayed_diff(batch, delayed, direction);
            }
            for diff in diffs.siafund_output_diffs.iter().rev() {
                stage_bucket_diff!(batch, diff, direction, put_siafund_output, delete_siafund_output);
            }
            for diff in diffs.file_contract_diffs.iter().rev() {
                stage_bucket_diff!(batch, diff, direction, put_file_contract, delete_file_contract);
            }
            for diff in diffs.siacoin_output_diffs.iter().rev() {
                stage_bucket_diff!(batch, diff, direction, put_siacoin_output, delete_siacoin_output);
            }
        }
    }
}

fn stage_delayed_diff(
    batch: &mut StateBatch,
    delayed: &crate::diffs::DelayedOutputDiff,
    direction: DiffDirection,
) {
    match (&delayed.diff, direction) {
        (BucketDiff::Created { id, value }, DiffDirection::Apply)
        | (BucketDiff::Removed { id, value }, DiffDirection::Revert) => {
            batch.put_delayed_output(delayed.maturity_height, *id, value.clone());
        }
        (BucketDiff::Created { id, .. }, DiffDirection::Revert)
        | (BucketDiff::Removed { id, .. }, DiffDirection::Apply) => {
            batch.delete_delayed_output(delayed.maturity_height, *id);
        }
    }
}

impl<S: ChainStore, R: DiffSource> ConsensusSet<S, R> {
    /// Commit a block's diff set in the given direction, together with its
    /// current-path entry, as one atomic store transaction.
    ///
    /// Preconditions (violations are fatal):
    /// - Apply: the block extends the current tip and its diffs have been
    ///   generated.
    /// - Revert: the block is the current tip (genesis cannot be reverted).
    pub(crate) async fn commit_diff_set(
        &mut self,
        pb: &ProcessedBlock,
        direction: DiffDirection,
    ) -> ConsensusResult<()> {
        let (tip_height, tip_id) = self.tip().await?;
        match direction {
            DiffDirection::Apply => {
                if pb.parent_id() != tip_id {
                    return Err(ConsensusError::Inconsistent(format!(
                        "apply of block {} which does not extend the tip {}",
                        pb.id(),
                        tip_id
                    )));
                }
                if pb.height != tip_height + 1 {
                    return Err(ConsensusError::Inconsistent(format!(
                        "block {} has height {} but the tip is at {}",
                        pb.id(),
                        pb.height,
                        tip_height
                    )));
                }
                if !pb.diffs_generated {
                    return Err(ConsensusError::Inconsistent(format!(
                        "apply of block {} whose diffs have not been generated",
                        pb.id()
                    )));
                }
            }
            DiffDirection::Revert => {
                if pb.id() != tip_id {
                    return Err(ConsensusError::Inconsistent(format!(
                        "revert of block {} which is not the tip {}",
                        pb.id(),
                        tip_id
                    )));
                }
                if pb.height == 0 {
                    return Err(ConsensusError::Inconsistent(
                        "revert of the genesis block".into(),
                    ));
                }
            }
        }

        let mut batch = StateBatch::new();
        stage_diff_set(&mut batch, &pb.diff_set, direction);
        match direction {
            DiffDirection::Apply => batch.push_path(pb.height, pb.id()),
            DiffDirection::Revert => batch.pop_path(pb.height),
        }
        self.store.commit(batch).await?;
        tracing::debug!(
            block = %pb.id(),
            height = pb.height,
            ?direction,
            deltas = pb.diff_set.len(),
            "committed diff set"
        );
        Ok(())
    }
}
