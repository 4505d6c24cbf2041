//! End-to-end fork and reorganization scenarios.

#[cfg(test)]
mod tests {
    use crate::engine::{ConsensusSet, ForkOutcome};
    use crate::error::{BlockRejection, ConsensusError};
    use crate::store::{ChainStore, MemoryChainStore, StateReader};
    use crate::test_utils::{CountingRules, TestChain};
    use crate::types::BlockId;

    /// The current path must be defined exactly on [0, tip] and every entry
    /// must link to the one below it.
    async fn assert_path_contiguous(cs: &ConsensusSet<MemoryChainStore, CountingRules>) {
        let (tip_height, _) = cs.tip().await.unwrap();
        let mut prev: Option<BlockId> = None;
        for height in 0..=tip_height {
            let id = cs
                .path_at(height)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("path has a gap at height {}", height));
            let pb = cs.store().get_block(&id).await.unwrap().unwrap();
            assert_eq!(pb.height, height);
            if let Some(prev) = prev {
                assert_eq!(pb.parent_id(), prev, "path entry does not link to parent");
            }
            prev = Some(id);
        }
        assert_eq!(cs.path_at(tip_height + 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn no_op_fork_changes_nothing() {
        let mut chain = TestChain::new().await.unwrap();
        chain.extend_tip(2, 1).await.unwrap();

        let tip = chain.cs.tip_id().await.unwrap();
        let hash = chain.cs.consensus_set_hash().await.unwrap();

        let outcome = chain.cs.fork_blockchain(tip).await.unwrap();
        assert_eq!(
            outcome,
            ForkOutcome {
                reverted: Vec::new(),
                applied: Vec::new(),
            }
        );
        assert_eq!(chain.cs.tip_id().await.unwrap(), tip);
        assert_eq!(chain.cs.consensus_set_hash().await.unwrap(), hash);
    }

    #[tokio::test]
    async fn linear_extension_generates_diffs() {
        let mut chain = TestChain::new().await.unwrap();
        let tip = chain.cs.current_block().await.unwrap();

        let block = chain.subsidy_block(&tip, 1);
        let pb = chain.link(block).await.unwrap();
        assert!(!pb.diffs_generated);

        let outcome = chain.cs.fork_blockchain(pb.id()).await.unwrap();
        assert!(outcome.reverted.is_empty());
        assert_eq!(outcome.applied, vec![pb.id()]);
        assert_eq!(chain.cs.tip_id().await.unwrap(), pb.id());

        let stored = chain.cs.store().get_block(&pb.id()).await.unwrap().unwrap();
        assert!(stored.diffs_generated);
        assert!(!stored.diff_set.is_empty());
        assert_path_contiguous(&chain.cs).await;
    }

    #[tokio::test]
    async fn shallow_reorg_and_return_restores_state_hash() {
        let mut chain = TestChain::new().await.unwrap();
        let applied = chain.extend_tip(2, 1).await.unwrap();
        let (a, b) = (applied[0].clone(), applied[1].clone());

        let start_hash = chain.cs.consensus_set_hash().await.unwrap();

        // Sibling branch from A, one block longer than the current path.
        let c = chain.link(chain.subsidy_block(&a, 10)).await.unwrap();
        let d = chain.link(chain.subsidy_block(&c, 11)).await.unwrap();

        let outcome = chain.cs.fork_blockchain(d.id()).await.unwrap();
        assert_eq!(outcome.reverted, vec![b.id()]);
        assert_eq!(outcome.applied, vec![c.id(), d.id()]);
        assert_eq!(chain.cs.tip().await.unwrap(), (3, d.id()));
        assert_path_contiguous(&chain.cs).await;

        // Fork back to the original tip.
        let outcome = chain.cs.fork_blockchain(b.id()).await.unwrap();
        assert_eq!(outcome.reverted, vec![d.id(), c.id()]);
        assert_eq!(outcome.applied, vec![b.id()]);
        assert_eq!(chain.cs.tip().await.unwrap(), (2, b.id()));
        assert_eq!(chain.cs.consensus_set_hash().await.unwrap(), start_hash);
        assert_path_contiguous(&chain.cs).await;
    }

    #[tokio::test]
    async fn invalid_fork_is_rejected_and_state_restored() {
        let mut chain = TestChain::new().await.unwrap();
        let applied = chain.extend_tip(2, 1).await.unwrap();
        let (a, b) = (applied[0].clone(), applied[1].clone());

        let hash = chain.cs.consensus_set_hash().await.unwrap();

        let c = chain.link(chain.subsidy_block(&a, 10)).await.unwrap();
        let d = chain.link(chain.invalid_block(&c, 11)).await.unwrap();

        let err = chain.cs.fork_blockchain(d.id()).await.unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::InvalidBlock(BlockRejection::DoubleSpend)
        ));

        // Bit-identical restoration of the pre-call state.
        assert_eq!(chain.cs.tip().await.unwrap(), (2, b.id()));
        assert_eq!(chain.cs.consensus_set_hash().await.unwrap(), hash);
        assert_path_contiguous(&chain.cs).await;

        // Recovery purity: the original path still has its diffs.
        for pb in [&a, &b] {
            let stored = chain.cs.store().get_block(&pb.id()).await.unwrap().unwrap();
            assert!(stored.diffs_generated);
        }
    }

    #[tokio::test]
    async fn retry_after_failed_fork_uses_stored_diffs() {
        let mut chain = TestChain::new().await.unwrap();
        let applied = chain.extend_tip(2, 1).await.unwrap();
        let (a, b) = (applied[0].clone(), applied[1].clone());

        let c = chain.link(chain.subsidy_block(&a, 10)).await.unwrap();
        let d = chain.link(chain.invalid_block(&c, 11)).await.unwrap();

        chain.cs.fork_blockchain(d.id()).await.unwrap_err();
        // C was generated during the failed fork and D's generation was
        // attempted once.
        let calls_after_failure = chain.generate_calls();

        // Forking to C now replays its stored diff set without generation.
        let outcome = chain.cs.fork_blockchain(c.id()).await.unwrap();
        assert_eq!(outcome.reverted, vec![b.id()]);
        assert_eq!(outcome.applied, vec![c.id()]);
        assert_eq!(chain.generate_calls(), calls_after_failure);
    }

    #[tokio::test]
    async fn deep_reorg_to_genesis_sibling() {
        let mut chain = TestChain::new().await.unwrap();
        let a = chain.extend_tip(3, 1).await.unwrap();
        let genesis = chain.genesis.clone();

        let b = chain.link_chain(&genesis, 5, 100).await.unwrap();

        let outcome = chain.cs.fork_blockchain(b[4].id()).await.unwrap();
        assert_eq!(
            outcome.reverted,
            vec![a[2].id(), a[1].id(), a[0].id()],
            "reverts walk from the tip down"
        );
        assert_eq!(
            outcome.applied,
            b.iter().map(|pb| pb.id()).collect::<Vec<_>>(),
            "applies walk in ascending height order"
        );
        assert_eq!(chain.cs.tip().await.unwrap(), (5, b[4].id()));
        assert_path_contiguous(&chain.cs).await;
    }

    #[tokio::test]
    async fn fork_to_ancestor_only_reverts() {
        let mut chain = TestChain::new().await.unwrap();
        let a = chain.extend_tip(1, 1).await.unwrap().remove(0);
        let hash_at_a = chain.cs.consensus_set_hash().await.unwrap();
        let b = chain.extend_tip(1, 2).await.unwrap().remove(0);

        let outcome = chain.cs.fork_blockchain(a.id()).await.unwrap();
        assert_eq!(outcome.reverted, vec![b.id()]);
        assert!(outcome.applied.is_empty());
        assert_eq!(chain.cs.tip().await.unwrap(), (1, a.id()));
        // Apply then revert leaves state byte-identical.
        assert_eq!(chain.cs.consensus_set_hash().await.unwrap(), hash_at_a);
    }

    #[tokio::test]
    async fn backtrack_finds_the_common_parent() {
        let mut chain = TestChain::new().await.unwrap();
        let applied = chain.extend_tip(2, 1).await.unwrap();
        let a = applied[0].clone();

        let c = chain.link(chain.subsidy_block(&a, 10)).await.unwrap();
        let d = chain.link(chain.subsidy_block(&c, 11)).await.unwrap();

        let path = chain
            .cs
            .backtrack_to_current_path(d.clone())
            .await
            .unwrap();
        let ids: Vec<BlockId> = path.iter().map(|pb| pb.id()).collect();
        assert_eq!(ids, vec![a.id(), c.id(), d.id()]);

        // The common parent lies on the current path; every later element
        // links to its predecessor.
        assert_eq!(
            chain.cs.path_at(path[0].height).await.unwrap(),
            Some(a.id())
        );
        for pair in path.windows(2) {
            assert_eq!(pair[1].parent_id(), pair[0].id());
        }

        // A block already on the path backtracks to itself.
        let tip = chain.cs.current_block().await.unwrap();
        let path = chain.cs.backtrack_to_current_path(tip.clone()).await.unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].id(), tip.id());
    }

    #[tokio::test]
    async fn revert_to_block_off_the_path_is_fatal() {
        let mut chain = TestChain::new().await.unwrap();
        let applied = chain.extend_tip(2, 1).await.unwrap();
        let a = applied[0].clone();

        let c = chain.link(chain.subsidy_block(&a, 10)).await.unwrap();

        let err = chain.cs.revert_to_node(&c).await.unwrap_err();
        assert!(matches!(err, ConsensusError::ExternalRevert));
        // Nothing was reverted.
        assert_eq!(chain.cs.tip().await.unwrap().0, 2);
    }

    #[tokio::test]
    async fn unknown_tip_fails_fast() {
        let mut chain = TestChain::new().await.unwrap();
        chain.extend_tip(1, 1).await.unwrap();

        let tip = chain.cs.tip().await.unwrap();
        let hash = chain.cs.consensus_set_hash().await.unwrap();

        let bogus = BlockId([0xee; 32]);
        let err = chain.cs.fork_blockchain(bogus).await.unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownBlock(id) if id == bogus));
        assert_eq!(chain.cs.tip().await.unwrap(), tip);
        assert_eq!(chain.cs.consensus_set_hash().await.unwrap(), hash);
    }

    #[tokio::test]
    async fn generation_runs_once_per_block() {
        let mut chain = TestChain::new().await.unwrap();
        let applied = chain.extend_tip(2, 1).await.unwrap();
        let (a, b) = (applied[0].clone(), applied[1].clone());
        assert_eq!(chain.generate_calls(), 2);

        let c = chain.link(chain.subsidy_block(&a, 10)).await.unwrap();
        let d = chain.link(chain.subsidy_block(&c, 11)).await.unwrap();

        chain.cs.fork_blockchain(d.id()).await.unwrap();
        assert_eq!(chain.generate_calls(), 4, "C and D generated once each");

        // Forking back and forth replays stored diffs only.
        chain.cs.fork_blockchain(b.id()).await.unwrap();
        chain.cs.fork_blockchain(d.id()).await.unwrap();
        assert_eq!(chain.generate_calls(), 4);
    }

    #[tokio::test]
    async fn reverted_outputs_reappear() {
        let mut chain = TestChain::new().await.unwrap();
        let genesis = chain.genesis.clone();
        let spent_id = chain.genesis_output_id();
        let value = crate::test_utils::GENESIS_OUTPUT_VALUE;

        let spend = chain.spend_block(&genesis, 1, spent_id, value);
        let created_id = spend.transactions[0].siacoin_output_id(0);
        let pb = chain.link(spend).await.unwrap();

        chain.cs.fork_blockchain(pb.id()).await.unwrap();
        assert_eq!(
            chain.cs.store().get_siacoin_output(&spent_id).await.unwrap(),
            None,
            "spent output leaves the live bucket"
        );
        assert!(chain
            .cs
            .store()
            .get_siacoin_output(&created_id)
            .await
            .unwrap()
            .is_some());

        chain.cs.fork_blockchain(genesis.id()).await.unwrap();
        assert!(
            chain
                .cs
                .store()
                .get_siacoin_output(&spent_id)
                .await
                .unwrap()
                .is_some(),
            "reverting the spend reinstates the output"
        );
        assert_eq!(
            chain
                .cs
                .store()
                .get_siacoin_output(&created_id)
                .await
                .unwrap(),
            None,
            "reverting the spend removes the created output"
        );
    }
}
