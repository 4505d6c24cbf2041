//! Transaction-level validation and diff generation.
//!
//! [`DiffSource`] is the boundary between the fork engine and the rule set:
//! given the pre-block state (the live state at the block's parent) and a
//! processed block, it either produces the block's [`DiffSet`] or rejects
//! the block. [`StandardRules`] is the stock implementation.
//!
//! Header-level validation (proof of work, difficulty, timestamps) happens
//! before blocks are linked into the tree and is not repeated here.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::diffs::{BucketDiff, DelayedOutputDiff, DiffSet, SiafundPoolDiff};
use crate::error::{BlockRejection, ConsensusError, ConsensusResult};
use crate::store::StateReader;
use crate::types::{
    proof_output_id, Currency, FileContract, FileContractId, ProcessedBlock, SiacoinOutput,
    SiacoinOutputId, SiafundOutput, SiafundOutputId,
};

/// Number of blocks before a delayed output (miner payout or contract
/// resolution) becomes spendable.
pub const MATURITY_DELAY: u64 = 50;

/// Fixed per-block miner subsidy.
pub const BLOCK_SUBSIDY: Currency = Currency(50_000);

/// Portion of a file contract payout taken as siafund tax: payout / 25.
const CONTRACT_TAX_DIVISOR: u128 = 25;

/// Siafund tax levied when a file contract is formed.
pub fn contract_tax(payout: Currency) -> Currency {
    Currency(payout.0 / CONTRACT_TAX_DIVISOR)
}

/// Produces the diff set for a block whose diffs have not been generated.
///
/// Implementations must not mutate any state: the generator commits the
/// returned diff set itself, in the same transaction that marks the block's
/// diffs as generated.
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Run the state transition for `pb` against `state` (the live state at
    /// `pb`'s parent). A rejected block surfaces as
    /// [`ConsensusError::InvalidBlock`]; storage failures propagate as
    /// [`ConsensusError::Storage`].
    async fn generate(
        &self,
        state: &dyn StateReader,
        pb: &ProcessedBlock,
    ) -> ConsensusResult<DiffSet>;
}

/// The standard rule set.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

/// Working state while a block's transactions are folded into a diff set.
/// Outputs created earlier in the block are spendable by later transactions;
/// everything resolves against `state` otherwise.
struct BlockContext<'a> {
    state: &'a dyn StateReader,
    height: u64,
    diffs: DiffSet,
    spent_siacoin: HashSet<SiacoinOutputId>,
    created_siacoin: HashMap<SiacoinOutputId, SiacoinOutput>,
    spent_siafund: HashSet<SiafundOutputId>,
    created_siafund: HashMap<SiafundOutputId, SiafundOutput>,
    created_contracts: HashMap<FileContractId, FileContract>,
    resolved_contracts: HashSet<FileContractId>,
    pool: Currency,
}

impl<'a> BlockContext<'a> {
    async fn new(state: &'a dyn StateReader, height: u64) -> ConsensusResult<Self> {
        Ok(BlockContext {
            state,
            height,
            diffs: DiffSet::default(),
            spent_siacoin: HashSet::new(),
            created_siacoin: HashMap::new(),
            spent_siafund: HashSet::new(),
            created_siafund: HashMap::new(),
            created_contracts: HashMap::new(),
            resolved_contracts: HashSet::new(),
            pool: state.siafund_pool().await?,
        })
    }

    async fn spend_siacoin(&mut self, id: SiacoinOutputId) -> ConsensusResult<Currency> {
        if self.spent_siacoin.contains(&id) {
            return Err(BlockRejection::DoubleSpend.into());
        }
        let output = match self.created_siacoin.get(&id) {
            Some(output) => output.clone(),
            None => self
                .state
                .get_siacoin_output(&id)
                .await?
                .ok_or(BlockRejection::DoubleSpend)?,
        };
        self.spent_siacoin.insert(id);
        let value = output.value;
        self.diffs
            .siacoin_output_diffs
            .push(BucketDiff::Removed { id, value: output });
        Ok(value)
    }

    fn create_siacoin(&mut self, id: SiacoinOutputId, output: SiacoinOutput) {
        self.created_siacoin.insert(id, output.clone());
        self.diffs
            .siacoin_output_diffs
            .push(BucketDiff::Created { id, value: output });
    }

    async fn spend_siafund(&mut self, id: SiafundOutputId) -> ConsensusResult<Currency> {
        if self.spent_siafund.contains(&id) {
            return Err(BlockRejection::DoubleSpend.into());
        }
        let output = match self.created_siafund.get(&id) {
            Some(output) => output.clone(),
            None => self
                .state
                .get_siafund_output(&id)
                .await?
                .ok_or(BlockRejection::DoubleSpend)?,
        };
        self.spent_siafund.insert(id);
        let value = output.value;
        self.diffs
            .siafund_output_diffs
            .push(BucketDiff::Removed { id, value: output });
        Ok(value)
    }

    fn create_siafund(&mut self, id: SiafundOutputId, output: SiafundOutput) {
        self.created_siafund.insert(id, output.clone());
        self.diffs
            .siafund_output_diffs
            .push(BucketDiff::Created { id, value: output });
    }

    fn create_contract(&mut self, id: FileContractId, contract: FileContract) -> ConsensusResult<()> {
        let tax = contract_tax(contract.payout);
        let adjusted = self.pool.checked_add(tax).ok_or_else(|| {
            ConsensusError::from(BlockRejection::InvalidTransaction(
                "siafund pool overflow".into(),
            ))
        })?;
        self.created_contracts.insert(id, contract.clone());
        self.diffs.file_contract_diffs.push(BucketDiff::Created {
            id,
            value: contract,
        });
        self.diffs.siafund_pool_diffs.push(SiafundPoolDiff {
            previous: self.pool,
            adjusted,
        });
        self.pool = adjusted;
        Ok(())
    }

    async fn resolve_contract(&mut self, id: FileContractId) -> ConsensusResult<FileContract> {
        if self.resolved_contracts.contains(&id) {
            return Err(BlockRejection::StorageProof("contract already resolved".into()).into());
        }
        let contract = match self.created_contracts.get(&id) {
            Some(contract) => contract.clone(),
            None => self
                .state
                .get_file_contract(&id)
                .await?
                .ok_or_else(|| BlockRejection::StorageProof("unknown contract".into()))?,
        };
        if self.height < contract.window_start {
            return Err(BlockRejection::StorageProof("proof window not yet open".into()).into());
        }
        if self.height > contract.window_end {
            return Err(BlockRejection::StorageProof("proof window closed".into()).into());
        }
        self.resolved_contracts.insert(id);
        self.diffs.file_contract_diffs.push(BucketDiff::Removed {
            id,
            value: contract.clone(),
        });
        Ok(contract)
    }

    fn create_delayed(&mut self, maturity_height: u64, id: SiacoinOutputId, output: SiacoinOutput) {
        self.diffs.delayed_output_diffs.push(DelayedOutputDiff {
            maturity_height,
            diff: BucketDiff::Created { id, value: output },
        });
    }

    /// Move every delayed output maturing at the current height into the
    /// live siacoin bucket.
    async fn mature_delayed_outputs(&mut self) -> ConsensusResult<()> {
        for (id, output) in self.state.delayed_outputs_at(self.height).await? {
            self.diffs.delayed_output_diffs.push(DelayedOutputDiff {
                maturity_height: self.height,
                diff: BucketDiff::Removed {
                    id,
                    value: output.clone(),
                },
            });
            self.create_siacoin(id, output);
        }
        Ok(())
    }
}

fn sum_outputs(outputs: &[SiacoinOutput]) -> Option<Currency> {
    outputs
        .iter()
        .try_fold(Currency::ZERO, |acc, out| acc.checked_add(out.value))
}

fn check_contract(height: u64, contract: &FileContract) -> Result<(), BlockRejection> {
    if contract.payout.is_zero() {
        return Err(BlockRejection::InvalidTransaction(
            "file contract has zero payout".into(),
        ));
    }
    if contract.window_start <= height {
        return Err(BlockRejection::InvalidTransaction(
            "file contract proof window must open after formation".into(),
        ));
    }
    if contract.window_end < contract.window_start {
        return Err(BlockRejection::InvalidTransaction(
            "file contract proof window ends before it starts".into(),
        ));
    }
    let outlay = contract
        .payout
        .checked_sub(contract_tax(contract.payout))
        .expect("tax is a fraction of the payout");
    for (name, outputs) in [
        ("valid", &contract.valid_proof_outputs),
        ("missed", &contract.missed_proof_outputs),
    ] {
        let total =
            sum_outputs(outputs).ok_or_else(|| {
                BlockRejection::InvalidTransaction("contract payout overflow".into())
            })?;
        if total != outlay {
            return Err(BlockRejection::InvalidTransaction(format!(
                "{} proof outputs do not sum to payout minus tax",
                name
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl DiffSource for StandardRules {
    async fn generate(
        &self,
        state: &dyn StateReader,
        pb: &ProcessedBlock,
    ) -> ConsensusResult<DiffSet> {
        let mut ctx = BlockContext::new(state, pb.height).await?;
        let mut total_fees = Currency::ZERO;

        for tx in &pb.block.transactions {
            let fees = tx.total_fees().ok_or_else(|| {
                ConsensusError::from(BlockRejection::InvalidTransaction(
                    "fee overflow".into(),
                ))
            })?;
            total_fees = total_fees
                .checked_add(fees)
                .ok_or_else(|| {
                    ConsensusError::from(BlockRejection::InvalidTransaction(
                        "fee overflow".into(),
                    ))
                })?;

            // Siacoin side: inputs must exactly cover outputs, contract
            // payouts, and fees.
            let mut inflow = Currency::ZERO;
            for input in &tx.siacoin_inputs {
                let value = ctx.spend_siacoin(input.parent_id).await?;
                inflow = inflow.checked_add(value).ok_or_else(|| {
                    ConsensusError::from(BlockRejection::InvalidTransaction(
                        "input value overflow".into(),
                    ))
                })?;
            }

            let mut outflow = fees;
            for (index, output) in tx.siacoin_outputs.iter().enumerate() {
                if output.value.is_zero() {
                    return Err(BlockRejection::InvalidTransaction(
                        "zero-value siacoin output".into(),
                    )
                    .into());
                }
                outflow = outflow.checked_add(output.value).ok_or_else(|| {
                    ConsensusError::from(BlockRejection::InvalidTransaction(
                        "output value overflow".into(),
                    ))
                })?;
                ctx.create_siacoin(tx.siacoin_output_id(index as u64), output.clone());
            }

            for (index, contract) in tx.file_contracts.iter().enumerate() {
                check_contract(pb.height, contract)?;
                outflow = outflow.checked_add(contract.payout).ok_or_else(|| {
                    ConsensusError::from(BlockRejection::InvalidTransaction(
                        "contract payout overflow".into(),
                    ))
                })?;
                ctx.create_contract(tx.file_contract_id(index as u64), contract.clone())?;
            }

            if inflow != outflow {
                return Err(BlockRejection::InvalidTransaction(
                    "siacoin value not conserved".into(),
                )
                .into());
            }

            // Storage proofs pay out of escrow, not out of the transaction.
            for proof in &tx.storage_proofs {
                let contract = ctx.resolve_contract(proof.parent_id).await?;
                for (index, output) in contract.valid_proof_outputs.iter().enumerate() {
                    ctx.create_delayed(
                        pb.height + MATURITY_DELAY,
                        proof_output_id(&proof.parent_id, index as u64),
                        output.clone(),
                    );
                }
            }

            // Siafund side: a separate denomination with its own exact
            // conservation rule.
            let mut sf_inflow = Currency::ZERO;
            for input in &tx.siafund_inputs {
                let value = ctx.spend_siafund(input.parent_id).await?;
                sf_inflow = sf_inflow.checked_add(value).ok_or_else(|| {
                    ConsensusError::from(BlockRejection::SiafundMisuse(
                        "siafund input overflow".into(),
                    ))
                })?;
            }
            let mut sf_outflow = Currency::ZERO;
            for (index, output) in tx.siafund_outputs.iter().enumerate() {
                if output.value.is_zero() {
                    return Err(BlockRejection::SiafundMisuse(
                        "zero-value siafund output".into(),
                    )
                    .into());
                }
                sf_outflow = sf_outflow.checked_add(output.value).ok_or_else(|| {
                    ConsensusError::from(BlockRejection::SiafundMisuse(
                        "siafund output overflow".into(),
                    ))
                })?;
                ctx.create_siafund(tx.siafund_output_id(index as u64), output.clone());
            }
            if sf_inflow != sf_outflow {
                return Err(
                    BlockRejection::SiafundMisuse("siafund value not conserved".into()).into(),
                );
            }
        }

        ctx.mature_delayed_outputs().await?;

        // Miner payouts must sum to subsidy plus fees and mature later.
        let expected = BLOCK_SUBSIDY
            .checked_add(total_fees)
            .ok_or_else(|| ConsensusError::from(BlockRejection::InvalidMinerPayout))?;
        let mut payout_total = Currency::ZERO;
        for (index, payout) in pb.block.miner_payouts.iter().enumerate() {
            if payout.value.is_zero() {
                return Err(BlockRejection::InvalidMinerPayout.into());
            }
            payout_total = payout_total
                .checked_add(payout.value)
                .ok_or_else(|| ConsensusError::from(BlockRejection::InvalidMinerPayout))?;
            ctx.create_delayed(
                pb.height + MATURITY_DELAY,
                pb.block.miner_payout_id(index as u64),
                payout.clone(),
            );
        }
        if payout_total != expected {
            tracing::debug!(
                block = %pb.id(),
                %payout_total,
                %expected,
                "rejecting block: miner payout mismatch"
            );
            return Err(BlockRejection::InvalidMinerPayout.into());
        }

        Ok(ctx.diffs)
    }
}
