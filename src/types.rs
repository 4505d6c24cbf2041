//! Core domain types for the consensus set.
//!
//! Everything here is persisted through the chain store, so every type
//! derives `serde` traits and is encoded with `bincode`. Identifiers are
//! content-addressed: 32-byte Sha256 digests over the bincode encoding of
//! the identified object, with domain-separation tags where one object
//! spawns several ids (transaction outputs, miner payouts, proof payouts).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain-separation tags for derived identifiers.
const TAG_SIACOIN_OUTPUT: &[u8] = b"siacoin output";
const TAG_FILE_CONTRACT: &[u8] = b"file contract";
const TAG_SIAFUND_OUTPUT: &[u8] = b"siafund output";
const TAG_MINER_PAYOUT: &[u8] = b"miner payout";
const TAG_PROOF_OUTPUT: &[u8] = b"storage proof output";

/// Sha256 over a sequence of byte strings.
fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }
    };
}

id_type! {
    /// Content-addressed identifier of a block.
    BlockId
}
id_type! {
    /// Identifier of a siacoin output.
    SiacoinOutputId
}
id_type! {
    /// Identifier of a file contract.
    FileContractId
}
id_type! {
    /// Identifier of a siafund output.
    SiafundOutputId
}

/// Spend condition hash for an output. Opaque to the engine; ownership
/// verification happens in the external validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnlockHash(pub [u8; 32]);

impl std::fmt::Display for UnlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// An amount of currency. Arithmetic is checked; overflow surfaces as a
/// rejected transaction, never a wrap.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Currency(pub u128);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    pub fn checked_add(self, other: Currency) -> Option<Currency> {
        self.0.checked_add(other.0).map(Currency)
    }

    pub fn checked_sub(self, other: Currency) -> Option<Currency> {
        self.0.checked_sub(other.0).map(Currency)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A volume of currency owned by a spend condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiacoinOutput {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
}

/// A siafund (revenue-share) output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiafundOutput {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
}

/// An agreement to store data, escrowing its payout until the proof window
/// resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContract {
    pub file_size: u64,
    /// First height at which a storage proof is accepted.
    pub window_start: u64,
    /// Last height at which a storage proof is accepted.
    pub window_end: u64,
    pub payout: Currency,
    /// Outputs created when a valid proof resolves the contract.
    pub valid_proof_outputs: Vec<SiacoinOutput>,
    /// Outputs created if the window closes without a proof.
    pub missed_proof_outputs: Vec<SiacoinOutput>,
}

/// Consumes a siacoin output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiacoinInput {
    pub parent_id: SiacoinOutputId,
}

/// Consumes a siafund output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiafundInput {
    pub parent_id: SiafundOutputId,
}

/// Resolves a file contract during its proof window. The proof data itself
/// is verified by the external validator; the engine only needs the link to
/// the contract being resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProof {
    pub parent_id: FileContractId,
}

/// A transaction: consumed outputs, created outputs, contract operations,
/// and fees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub siacoin_inputs: Vec<SiacoinInput>,
    pub siacoin_outputs: Vec<SiacoinOutput>,
    pub file_contracts: Vec<FileContract>,
    pub storage_proofs: Vec<StorageProof>,
    pub siafund_inputs: Vec<SiafundInput>,
    pub siafund_outputs: Vec<SiafundOutput>,
    pub miner_fees: Vec<Currency>,
}

impl Transaction {
    /// Content hash of the transaction.
    pub fn id(&self) -> [u8; 32] {
        let encoded = bincode::serialize(self).expect("transaction serialization is infallible");
        hash_parts(&[&encoded])
    }

    /// Id of the `index`-th siacoin output created by this transaction.
    pub fn siacoin_output_id(&self, index: u64) -> SiacoinOutputId {
        SiacoinOutputId(hash_parts(&[
            TAG_SIACOIN_OUTPUT,
            &self.id(),
            &index.to_be_bytes(),
        ]))
    }

    /// Id of the `index`-th file contract created by this transaction.
    pub fn file_contract_id(&self, index: u64) -> FileContractId {
        FileContractId(hash_parts(&[
            TAG_FILE_CONTRACT,
            &self.id(),
            &index.to_be_bytes(),
        ]))
    }

    /// Id of the `index`-th siafund output created by this transaction.
    pub fn siafund_output_id(&self, index: u64) -> SiafundOutputId {
        SiafundOutputId(hash_parts(&[
            TAG_SIAFUND_OUTPUT,
            &self.id(),
            &index.to_be_bytes(),
        ]))
    }

    /// Sum of this transaction's miner fees.
    pub fn total_fees(&self) -> Option<Currency> {
        self.miner_fees
            .iter()
            .try_fold(Currency::ZERO, |acc, fee| acc.checked_add(*fee))
    }
}

/// Id of the `index`-th payout of a resolved file contract.
pub fn proof_output_id(contract_id: &FileContractId, index: u64) -> SiacoinOutputId {
    SiacoinOutputId(hash_parts(&[
        TAG_PROOF_OUTPUT,
        contract_id.as_bytes(),
        &index.to_be_bytes(),
    ]))
}

/// A raw block: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub parent_id: BlockId,
    pub nonce: u64,
    pub timestamp: u64,
    pub miner_payouts: Vec<SiacoinOutput>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Content-addressed id of the block.
    pub fn id(&self) -> BlockId {
        let encoded = bincode::serialize(self).expect("block serialization is infallible");
        BlockId(hash_parts(&[&encoded]))
    }

    /// Id of the `index`-th miner payout of this block.
    pub fn miner_payout_id(&self, index: u64) -> SiacoinOutputId {
        SiacoinOutputId(hash_parts(&[
            TAG_MINER_PAYOUT,
            self.id().as_bytes(),
            &index.to_be_bytes(),
        ]))
    }
}

/// A block that has been validated and linked into the block tree.
///
/// Immutable after insertion, with one exception: the first time the block
/// is applied, `diffs_generated` flips to true and `diff_set` is populated,
/// in the same store transaction as the apply itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedBlock {
    pub block: Block,
    pub height: u64,
    pub diffs_generated: bool,
    pub diff_set: crate::diffs::DiffSet,
}

impl ProcessedBlock {
    /// Link a validated block into the tree at the given height. Diffs are
    /// generated lazily on first apply.
    pub fn new(block: Block, height: u64) -> Self {
        ProcessedBlock {
            block,
            height,
            diffs_generated: false,
            diff_set: crate::diffs::DiffSet::default(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn parent_id(&self) -> BlockId {
        self.block.parent_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(nonce: u64) -> Block {
        Block {
            parent_id: BlockId([0u8; 32]),
            nonce,
            timestamp: 1,
            miner_payouts: Vec::new(),
            transactions: Vec::new(),
        }
    }

    #[test]
    fn block_ids_are_content_addressed() {
        assert_eq!(sample_block(1).id(), sample_block(1).id());
        assert_ne!(sample_block(1).id(), sample_block(2).id());
    }

    #[test]
    fn derived_output_ids_are_distinct_per_index_and_tag() {
        let tx = Transaction {
            siacoin_outputs: vec![
                SiacoinOutput {
                    value: Currency(5),
                    unlock_hash: UnlockHash([1u8; 32]),
                };
                2
            ],
            ..Transaction::default()
        };
        assert_ne!(tx.siacoin_output_id(0), tx.siacoin_output_id(1));
        // Same index, different tag namespaces.
        assert_ne!(
            tx.siacoin_output_id(0).0,
            tx.siafund_output_id(0).0
        );
    }

    #[test]
    fn currency_arithmetic_is_checked() {
        assert_eq!(
            Currency(u128::MAX).checked_add(Currency(1)),
            None
        );
        assert_eq!(Currency(3).checked_sub(Currency(5)), None);
        assert_eq!(
            Currency(3).checked_add(Currency(4)),
            Some(Currency(7))
        );
    }
}
