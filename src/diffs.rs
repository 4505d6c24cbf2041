//! Invertible state deltas recorded per block.
//!
//! A [`DiffSet`] is the bundle of changes a single block makes to live
//! consensus state. Every delta carries enough information to be undone:
//! removals keep the removed value, and the pool diff records both sides of
//! the adjustment. Applying a diff set installs deltas in recorded order;
//! reverting installs the inverse deltas in exact reverse order, so that
//! apply followed by revert is the identity on state.

use serde::{Deserialize, Serialize};

use crate::types::{
    Currency, FileContract, FileContractId, SiacoinOutput, SiacoinOutputId, SiafundOutput,
    SiafundOutputId,
};

/// Direction in which a diff set is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffDirection {
    Apply,
    Revert,
}

/// A single change to one keyed state bucket.
///
/// `Removed` carries the full removed value so the revert direction can
/// reinstate it without consulting any other record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketDiff<Id, V> {
    Created { id: Id, value: V },
    Removed { id: Id, value: V },
}

impl<Id: Copy, V> BucketDiff<Id, V> {
    pub fn id(&self) -> Id {
        match self {
            BucketDiff::Created { id, .. } | BucketDiff::Removed { id, .. } => *id,
        }
    }
}

pub type SiacoinOutputDiff = BucketDiff<SiacoinOutputId, SiacoinOutput>;
pub type FileContractDiff = BucketDiff<FileContractId, FileContract>;
pub type SiafundOutputDiff = BucketDiff<SiafundOutputId, SiafundOutput>;

/// A change to the delayed-output bucket, keyed by the height at which the
/// output matures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedOutputDiff {
    pub maturity_height: u64,
    pub diff: BucketDiff<SiacoinOutputId, SiacoinOutput>,
}

/// An adjustment of the siafund pool. Both sides are recorded so a revert
/// restores `previous` without reading state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiafundPoolDiff {
    pub previous: Currency,
    pub adjusted: Currency,
}

/// All deltas a single block makes to consensus state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSet {
    pub siacoin_output_diffs: Vec<SiacoinOutputDiff>,
    pub file_contract_diffs: Vec<FileContractDiff>,
    pub siafund_output_diffs: Vec<SiafundOutputDiff>,
    pub delayed_output_diffs: Vec<DelayedOutputDiff>,
    pub siafund_pool_diffs: Vec<SiafundPoolDiff>,
}

impl DiffSet {
    /// Total number of deltas across all buckets.
    pub fn len(&self) -> usize {
        self.siacoin_output_diffs.len()
            + self.file_contract_diffs.len()
            + self.siafund_output_diffs.len()
            + self.delayed_output_diffs.len()
            + self.siafund_pool_diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnlockHash;

    #[test]
    fn diff_set_len_spans_buckets() {
        let output = SiacoinOutput {
            value: Currency(10),
            unlock_hash: UnlockHash([0u8; 32]),
        };
        let set = DiffSet {
            siacoin_output_diffs: vec![BucketDiff::Created {
                id: SiacoinOutputId([1u8; 32]),
                value: output.clone(),
            }],
            delayed_output_diffs: vec![DelayedOutputDiff {
                maturity_height: 50,
                diff: BucketDiff::Removed {
                    id: SiacoinOutputId([2u8; 32]),
                    value: output,
                },
            }],
            siafund_pool_diffs: vec![SiafundPoolDiff {
                previous: Currency::ZERO,
                adjusted: Currency(4),
            }],
            ..DiffSet::default()
        };
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());
        assert!(DiffSet::default().is_empty());
    }
}
