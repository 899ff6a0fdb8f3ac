//! Iterative dominator analysis.
//!
//! Computes, for every live block, the set of blocks every entry-to-here
//! path must pass through, then derives the immediate dominator from it.
//! The sets live in the blocks' scratch fields and are recomputed in place
//! on every run.
//!
//! The naive set-intersection form is deliberate: block counts per function
//! are tens, not thousands, and the bit sets make each intersection a few
//! word operations.

use tracing::debug;

use crate::{
    analysis::cfg::{BlockArena, BlockId},
    utils::BitSet,
};

/// Computes dominator sets and immediate dominators for every live block.
///
/// The entry sentinel dominates itself alone and has no immediate
/// dominator.
///
/// # Panics
///
/// Panics if the immediate-dominator elimination does not reduce to a
/// single candidate; that indicates a malformed graph, not a runtime
/// condition.
pub fn compute_dominators(arena: &mut BlockArena) {
    let universe = arena.len();
    let entry = arena.start();
    let ids: Vec<BlockId> = arena.live_ids().collect();

    for &id in &ids {
        let set = if id == entry {
            let mut set = BitSet::new(universe);
            set.insert(entry.index());
            set
        } else {
            BitSet::full(universe)
        };
        arena.block_mut(id).doms = Some(set);
    }

    let mut rounds = 0usize;
    loop {
        rounds += 1;
        let mut changed = false;

        for &id in &ids {
            if id == entry {
                continue;
            }

            let preds = arena.block(id).preds.clone();
            let mut new_set = BitSet::full(universe);
            for pred in preds {
                let pred_doms = arena
                    .block(pred)
                    .doms
                    .as_ref()
                    .expect("predecessor without a dominator set");
                new_set.intersect_with(pred_doms);
            }
            new_set.insert(id.index());

            let block = arena.block_mut(id);
            if block.doms.as_ref() != Some(&new_set) {
                block.doms = Some(new_set);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    for &id in &ids {
        let idom = if id == entry {
            None
        } else {
            Some(immediate_dominator(arena, id))
        };
        arena.block_mut(id).idom = idom;
    }

    debug!(blocks = ids.len(), rounds, "dominator sets converged");
}

/// Reduces `dom(id) - {id}` by discarding every candidate that dominates
/// another candidate; the survivor is the closest dominator.
fn immediate_dominator(arena: &BlockArena, id: BlockId) -> BlockId {
    let doms = arena
        .block(id)
        .doms
        .as_ref()
        .expect("immediate dominator requested before dominator sets");

    let mut residual: Vec<usize> = doms.iter().filter(|&d| d != id.index()).collect();
    assert!(
        !residual.is_empty(),
        "{id} has no dominator besides itself"
    );

    while residual.len() > 1 {
        let before = residual.len();
        residual = residual
            .iter()
            .copied()
            .filter(|&a| {
                // Keep a unless it dominates some other candidate.
                !residual.iter().any(|&b| {
                    a != b
                        && arena
                            .block(BlockId::from_index(b))
                            .doms
                            .as_ref()
                            .is_some_and(|set| set.contains(a))
                })
            })
            .collect();
        assert!(
            residual.len() < before,
            "{id}: immediate-dominator elimination stalled"
        );
    }

    BlockId::from_index(residual[0])
}
