//! Chain-building harness for tests.
//!
//! Provides a consensus set over a memory store with a deterministic
//! genesis, block builders for valid and invalid blocks, and a rule-set
//! wrapper that counts diff generations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::diffs::DiffSet;
use crate::engine::{ConsensusSet, EngineConfig};
use crate::error::ConsensusResult;
use crate::store::{ChainStore, MemoryChainStore, StateReader};
use crate::types::{
    Block, BlockId, Currency, ProcessedBlock, SiacoinInput, SiacoinOutput, SiacoinOutputId,
    Transaction, UnlockHash,
};
use crate::validation::{DiffSource, StandardRules, BLOCK_SUBSIDY};

/// Shorthand for a test unlock hash.
pub fn unlock_hash(n: u8) -> UnlockHash {
    UnlockHash([n; 32])
}

/// The value of the single spendable siacoin output in the test genesis.
pub const GENESIS_OUTPUT_VALUE: Currency = Currency(1_000_000);

/// Deterministic genesis block: one allocation transaction with a single
/// spendable siacoin output.
pub fn genesis_block() -> Block {
    Block {
        parent_id: BlockId([0u8; 32]),
        nonce: 0,
        timestamp: 0,
        miner_payouts: Vec::new(),
        transactions: vec![Transaction {
            siacoin_outputs: vec![SiacoinOutput {
                value: GENESIS_OUTPUT_VALUE,
                unlock_hash: unlock_hash(1),
            }],
            ..Transaction::default()
        }],
    }
}

/// Rule set wrapper that counts how many times diff generation runs.
#[derive(Clone, Default)]
pub struct CountingRules {
    inner: StandardRules,
    calls: Arc<AtomicUsize>,
}

impl CountingRules {
    /// Number of diff generations performed so far.
    pub fn generate_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffSource for CountingRules {
    async fn generate(
        &self,
        state: &dyn StateReader,
        pb: &ProcessedBlock,
    ) -> ConsensusResult<DiffSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(state, pb).await
    }
}

/// A consensus set over a memory store, seeded with [`genesis_block`] and
/// the state-hash self-check enabled.
pub struct TestChain {
    pub cs: ConsensusSet<MemoryChainStore, CountingRules>,
    pub genesis: ProcessedBlock,
    rules: CountingRules,
}

impl TestChain {
    pub async fn new() -> ConsensusResult<Self> {
        let store = MemoryChainStore::new().await?;
        let rules = CountingRules::default();
        let cs = ConsensusSet::new(
            store,
            rules.clone(),
            EngineConfig {
                verify_state_hash: true,
            },
            genesis_block(),
        )
        .await?;
        let genesis = cs.current_block().await?;
        Ok(TestChain { cs, genesis, rules })
    }

    /// Number of diff generations performed so far.
    pub fn generate_calls(&self) -> usize {
        self.rules.generate_calls()
    }

    /// Id of the spendable genesis siacoin output.
    pub fn genesis_output_id(&self) -> SiacoinOutputId {
        self.genesis.block.transactions[0].siacoin_output_id(0)
    }

    /// A valid empty block on `parent`: no transactions, miner payout equal
    /// to the subsidy. `nonce` varies the block id.
    pub fn subsidy_block(&self, parent: &ProcessedBlock, nonce: u64) -> Block {
        Block {
            parent_id: parent.id(),
            nonce,
            timestamp: parent.block.timestamp + 600,
            miner_payouts: vec![SiacoinOutput {
                value: BLOCK_SUBSIDY,
                unlock_hash: unlock_hash(2),
            }],
            transactions: Vec::new(),
        }
    }

    /// A valid block on `parent` that moves `input` (worth `input_value`)
    /// into a fresh output of the same value.
    pub fn spend_block(
        &self,
        parent: &ProcessedBlock,
        nonce: u64,
        input: SiacoinOutputId,
        input_value: Currency,
    ) -> Block {
        let mut block = self.subsidy_block(parent, nonce);
        block.transactions.push(Transaction {
            siacoin_inputs: vec![SiacoinInput { parent_id: input }],
            siacoin_outputs: vec![SiacoinOutput {
                value: input_value,
                unlock_hash: unlock_hash(3),
            }],
            ..Transaction::default()
        });
        block
    }

    /// A block on `parent` that the rule set rejects: its transaction spends
    /// an output that does not exist.
    pub fn invalid_block(&self, parent: &ProcessedBlock, nonce: u64) -> Block {
        let mut missing = [0xabu8; 32];
        missing[0] = nonce as u8;
        let mut block = self.subsidy_block(parent, nonce);
        block.transactions.push(Transaction {
            siacoin_inputs: vec![SiacoinInput {
                parent_id: SiacoinOutputId(missing),
            }],
            siacoin_outputs: vec![SiacoinOutput {
                value: Currency(1),
                unlock_hash: unlock_hash(4),
            }],
            ..Transaction::default()
        });
        block
    }

    /// Link a block into the tree without applying it.
    pub async fn link(&mut self, block: Block) -> ConsensusResult<ProcessedBlock> {
        self.cs.link_block(block).await
    }

    /// Link a chain of `count` valid empty blocks starting on `parent`,
    /// without applying any of them. Nonces start at `nonce_base`.
    pub async fn link_chain(
        &mut self,
        parent: &ProcessedBlock,
        count: usize,
        nonce_base: u64,
    ) -> ConsensusResult<Vec<ProcessedBlock>> {
        let mut blocks = Vec::with_capacity(count);
        let mut parent = parent.clone();
        for offset in 0..count {
            let block = self.subsidy_block(&parent, nonce_base + offset as u64);
            parent = self.link(block).await?;
            blocks.push(parent.clone());
        }
        Ok(blocks)
    }

    /// Extend the current path by `count` valid empty blocks, applying each.
    /// Returns the blocks as stored (diffs generated).
    pub async fn extend_tip(
        &mut self,
        count: usize,
        nonce_base: u64,
    ) -> ConsensusResult<Vec<ProcessedBlock>> {
        let tip = self.cs.current_block().await?;
        let linked = self.link_chain(&tip, count, nonce_base).await?;
        let last = linked.last().expect("count must be positive").id();
        self.cs.fork_blockchain(last).await?;

        let mut applied = Vec::with_capacity(linked.len());
        for pb in linked {
            let stored = self
                .cs
                .store()
                .get_block(&pb.id())
                .await?
                .expect("applied block is stored");
            applied.push(stored);
        }
        Ok(applied)
    }
}
