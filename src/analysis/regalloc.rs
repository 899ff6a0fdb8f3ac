//! Linear-scan register allocation and the instruction rewrite.
//!
//! Consumes the per-register live intervals, reassigns the local register
//! slots to the smallest set that keeps overlapping intervals apart, then
//! rewrites every instruction's register references and shifts the
//! non-register part of the literal index space down by the saved slots.
//!
//! Argument slots are pinned: callers address them by position, so only the
//! registers between `argument_end` and `register_end` participate in
//! allocation and compaction.

use tracing::debug;

use crate::{
    analysis::liveness::LiveInterval,
    bytecode::{Function, InstFlags, Instruction, Literal, LiteralType},
    Error, Result,
};

/// One interval's slot assignment, kept for the rewrite pass.
#[derive(Debug, Clone, Copy)]
struct Assignment {
    old: u16,
    new: u16,
    interval: LiveInterval,
}

/// A currently live allocation.
#[derive(Debug, Clone, Copy)]
struct Active {
    start: u32,
    end: u32,
    new_reg: u16,
}

/// Allocates with the function's own local register count as the budget.
///
/// At that budget pressure is unreachable (one register's intervals never
/// overlap each other), so the only possible outcome is success with a
/// register count no larger than the original.
///
/// # Errors
///
/// See [`allocate_with_budget`].
pub fn allocate_registers(func: &mut Function) -> Result<u16> {
    let budget = func.bounds().local_register_count();
    allocate_with_budget(func, budget)
}

/// Runs linear-scan allocation with an explicit local-register budget and
/// rewrites the function in place. Returns the new register count
/// (arguments included).
///
/// Precondition: liveness analysis has run.
///
/// # Errors
///
/// Returns [`Error::RegisterPressure`] when expiring finished intervals
/// cannot free a slot and the active set already fills `budget`. The
/// function is unmodified in that case.
pub fn allocate_with_budget(func: &mut Function, budget: u16) -> Result<u16> {
    debug_assert!(
        func.blocks.live_blocks().all(|b| b.live_out.is_some()),
        "allocation requires liveness analysis"
    );

    let arg_end = func.bounds().argument_end;
    let old_end = func.bounds().register_end;

    let mut worklist: Vec<(u16, LiveInterval)> = func
        .live_ranges
        .iter()
        .filter(|&(&reg, _)| reg >= arg_end && reg < old_end)
        .flat_map(|(&reg, intervals)| intervals.iter().map(move |&iv| (reg, iv)))
        .collect();
    worklist.sort_by_key(|&(reg, iv)| (iv.start, iv.end, reg));

    // Stack of free slots, lowest id on top; freed slots are reused before
    // untouched ones.
    let mut free: Vec<u16> = (arg_end..arg_end + budget).rev().collect();
    let mut active: Vec<Active> = Vec::new();
    let mut assignments: Vec<Assignment> = Vec::new();
    let mut peak = 0usize;
    let mut max_assigned: Option<u16> = None;

    for (old, interval) in worklist {
        active.sort_by_key(|entry| (entry.end, entry.start));
        while let Some(first) = active.first() {
            if first.end > interval.start {
                break;
            }
            let expired = active.remove(0);
            free.push(expired.new_reg);
        }

        if active.len() == usize::from(budget) {
            return Err(Error::RegisterPressure {
                needed: active.len() + 1,
                available: usize::from(budget),
            });
        }

        let new = if interval.is_degenerate() {
            // A dead write still needs an in-range destination; it can share
            // the next free slot because nothing ever reads it.
            *free.last().expect("free pool empty below budget")
        } else {
            let new = free.pop().expect("free pool empty below budget");
            active.push(Active {
                start: interval.start,
                end: interval.end,
                new_reg: new,
            });
            peak = peak.max(active.len());
            new
        };

        max_assigned = Some(max_assigned.map_or(new, |m| m.max(new)));
        assignments.push(Assignment { old, new, interval });
    }

    for assign in &assignments {
        if assign.old != assign.new {
            rewrite_span(&mut func.instructions, assign);
        }
    }

    let mut new_end = arg_end + peak as u16;
    if let Some(max) = max_assigned {
        new_end = new_end.max(max + 1);
    }
    debug_assert!(new_end <= old_end, "allocation grew the register count");

    let delta = old_end - new_end;
    if delta > 0 {
        shift_literals(&mut func.instructions, old_end, delta);
        func.bounds_mut().shrink_registers(delta);
        func.pool_mut().compact_registers(old_end, delta);
    }

    debug!(
        old = old_end,
        new = new_end,
        intervals = assignments.len(),
        "register allocation complete"
    );
    Ok(new_end)
}

/// Rewrites one interval's references from its old register id to its
/// assigned one, within the interval's byte range only. Per-interval spans
/// keep redefinitions of the same old register independent.
fn rewrite_span(instructions: &mut [Instruction], assign: &Assignment) {
    for inst in instructions.iter_mut() {
        if inst.offset < assign.interval.start {
            continue;
        }
        if inst.offset > assign.interval.end {
            break;
        }
        if inst.has(InstFlags::DEAD) {
            continue;
        }

        let defines = inst.offset == assign.interval.start && inst.write_reg == Some(assign.old);
        if defines {
            inst.write_reg = Some(assign.new);
            if let Some(lit) = inst.operands.literals.first_mut() {
                if is_register_literal(lit) && lit.index == assign.old {
                    lit.index = assign.new;
                }
            }
            // Reads at the defining offset see the value before the write
            // and belong to the preceding interval.
            continue;
        }

        for reg in &mut inst.read_regs {
            if *reg == assign.old {
                *reg = assign.new;
            }
        }
        for (pos, lit) in inst.operands.literals.iter_mut().enumerate() {
            if !is_register_literal(lit) || lit.index != assign.old {
                continue;
            }
            // The first literal of a writing instruction is its destination,
            // rewritten by the interval that starts there.
            if pos == 0 && inst.write_reg == Some(assign.old) {
                continue;
            }
            lit.index = assign.new;
        }
    }
}

/// Shifts every literal index at or past the old register boundary down by
/// the number of compacted slots.
fn shift_literals(instructions: &mut [Instruction], old_register_end: u16, delta: u16) {
    for inst in instructions.iter_mut() {
        if inst.has(InstFlags::DEAD) {
            continue;
        }
        for lit in &mut inst.operands.literals {
            if lit.index >= old_register_end {
                lit.shift_index(-i32::from(delta));
            }
        }
    }
}

fn is_register_literal(lit: &Literal) -> bool {
    matches!(lit.ty, LiteralType::Argument | LiteralType::Register)
}
