//! Liveness analysis and live-interval construction.
//!
//! Runs in three steps over one function: a stream-order scan filling each
//! block's kill and upward-exposed-use sets, a backward fixed point over
//! live-out sets, and a forward walk turning the per-instruction register
//! facts into per-register [`LiveInterval`] lists for the allocator.
//!
//! Offsets inside intervals are byte offsets of the owning instruction, used
//! purely as an ordering proxy. That is sound because block instruction
//! ranges are contiguous and non-overlapping in the final stream.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    bytecode::{Function, InstFlags},
    utils::BitSet,
};

/// A register's contiguous definition-to-last-use span.
///
/// `end == start` until a later read extends it; an interval never extended
/// past its start is a dead write and carries no real lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    /// Byte offset of the defining instruction.
    pub start: u32,
    /// Byte offset of the last reading instruction.
    pub end: u32,
}

impl LiveInterval {
    /// A fresh interval opened at `offset`.
    #[must_use]
    pub const fn at(offset: u32) -> Self {
        Self {
            start: offset,
            end: offset,
        }
    }

    /// Returns `true` if no read ever extended this interval.
    #[must_use]
    pub const fn is_degenerate(&self) -> bool {
        self.start == self.end
    }
}

/// Computes kill/upward-exposed-use/live-out sets for every live block and
/// fills the function's register live-range map.
///
/// Precondition: CFG construction and dominator analysis have run.
pub fn compute_liveness(func: &mut Function) {
    debug_assert!(
        func.blocks.live_blocks().all(|b| b.doms.is_some()),
        "liveness requires dominator analysis"
    );

    let regs = usize::from(func.bounds().register_count());

    compute_block_sets(func, regs);
    let rounds = propagate_live_out(func, regs);
    build_intervals(func);

    debug!(
        registers = func.live_ranges.len(),
        rounds, "liveness converged"
    );
}

/// Fills each block's kill and upward-exposed-use sets from the instruction
/// register facts, in stream order.
fn compute_block_sets(func: &mut Function, regs: usize) {
    let insts = &func.instructions;
    let ids: Vec<_> = func.blocks.live_ids().collect();

    for id in ids {
        let mut kill = BitSet::new(regs);
        let mut ue = BitSet::new(regs);

        for &idx in &func.blocks.block(id).insts {
            let inst = &insts[idx];
            for &reg in &inst.read_regs {
                if !kill.contains(usize::from(reg)) {
                    ue.insert(usize::from(reg));
                }
            }
            if let Some(reg) = inst.write_reg {
                kill.insert(usize::from(reg));
            }
        }

        let block = func.blocks.block_mut(id);
        block.kill = Some(kill);
        block.ue = Some(ue);
        block.live_out = Some(BitSet::new(regs));
    }
}

/// Backward fixed point: live-out(B) = union over successors S of
/// `ue(S) + (live-out(S) - kill(S))`. Returns the number of rounds taken.
fn propagate_live_out(func: &mut Function, regs: usize) -> usize {
    let ids: Vec<_> = func.blocks.live_ids().collect();

    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut changed = false;

        // Reverse id order approximates reverse topological order and
        // usually converges in two rounds.
        for &id in ids.iter().rev() {
            let succs = func.blocks.block(id).succs.clone();
            let mut out = BitSet::new(regs);

            for succ in succs {
                let sb = func.blocks.block(succ);
                let mut contrib = sb
                    .live_out
                    .clone()
                    .expect("successor without a live-out set");
                contrib.difference_with(sb.kill.as_ref().expect("successor without a kill set"));
                contrib.union_with(sb.ue.as_ref().expect("successor without a ue set"));
                out.union_with(&contrib);
            }

            let block = func.blocks.block_mut(id);
            if block.live_out.as_ref() != Some(&out) {
                block.live_out = Some(out);
                changed = true;
            }
        }

        if !changed {
            return rounds;
        }
    }
}

/// Builds the per-register interval lists: a write closes the register's
/// newest interval at its offset and opens a new one there, a read extends
/// the newest interval's end. Argument slots are live on entry and get an
/// interval opened at offset zero.
fn build_intervals(func: &mut Function) {
    let mut ranges: HashMap<u16, Vec<LiveInterval>> = HashMap::new();

    for arg in 0..func.bounds().argument_end {
        ranges.insert(arg, vec![LiveInterval::at(0)]);
    }

    for inst in &func.instructions {
        if inst.has(InstFlags::DEAD) {
            continue;
        }

        for &reg in &inst.read_regs {
            // A read with no prior write means live on entry, like an
            // argument: the interval opens at offset zero.
            let intervals = ranges
                .entry(reg)
                .or_insert_with(|| vec![LiveInterval::at(0)]);
            if let Some(last) = intervals.last_mut() {
                last.end = inst.offset;
            }
        }

        if let Some(reg) = inst.write_reg {
            let intervals = ranges.entry(reg).or_default();
            // A redefinition ends the previous lifetime here, not at its
            // last read; the old value is dead once the write retires.
            if let Some(last) = intervals.last_mut() {
                last.end = inst.offset;
            }
            intervals.push(LiveInterval::at(inst.offset));
        }
    }

    func.live_ranges = ranges;
}
